// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    cell::Deferred,
    collections::bytes::Bytes,
    dispatcher::Dispatcher,
    event::{fd_event, FdEventQueue},
    fail::Fail,
    streams::{ReadWrapper, StreamFd, WriteWrapper, HIGH_WATERMARK, LOW_WATERMARK},
};

use nix::{
    errno::Errno,
    sys::epoll::EpollFlags,
    sys::socket::{
        self, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag, SockProtocol, SockType,
    },
    unistd,
};

use std::{
    cell::RefCell,
    net::{SocketAddr, SocketAddrV4},
    os::unix::io::RawFd,
    rc::Rc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Lifecycle of a stream socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketState {
    Open,
    Connected,
    Listening,
    Closing,
    Closed,
}

struct SocketInner {
    fd: RawFd,
    state: SocketState,
    accept_queue: Option<FdEventQueue<StreamSocket>>,
    reader: Option<ReadWrapper>,
    writer: Option<WriteWrapper>,
}

/// An asynchronous TCP stream socket.
///
/// The underlying descriptor is non-blocking from creation. A connected
/// socket owns a read and a write wrapper; a listening socket owns an accept
/// queue. Handles are cheap clones of shared state.
pub struct StreamSocket {
    inner: Rc<RefCell<SocketInner>>,
    disp: Dispatcher,
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket").finish()
    }
}

impl PartialEq for StreamSocket {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

fn to_sockaddr(addr: SocketAddrV4) -> SockAddr {
    SockAddr::new_inet(InetAddr::from_std(&SocketAddr::V4(addr)))
}

fn connect_failure(error: nix::Error) -> Fail {
    match error {
        nix::Error::Sys(Errno::ECONNREFUSED) => Fail::ConnectionRefused {},
        other => Fail::from_os(other),
    }
}

/// Associate functions for [StreamSocket].
impl StreamSocket {
    /// Opens a fresh, unconnected socket.
    pub fn new(disp: &Dispatcher) -> Result<Self, Fail> {
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            SockProtocol::Tcp,
        )
        .map_err(Fail::from_os)?;
        Ok(Self::from_raw(disp, fd, SocketState::Open))
    }

    /// Builds a listening socket bound to `addr` in one step.
    pub fn listener(disp: &Dispatcher, addr: SocketAddrV4, backlog: usize) -> Result<Self, Fail> {
        let listener = Self::new(disp)?;
        listener.set_reuse_addr()?;
        listener.bind(addr)?;
        listener.listen(backlog)?;
        Ok(listener)
    }

    fn from_raw(disp: &Dispatcher, fd: RawFd, state: SocketState) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SocketInner {
                fd,
                state,
                accept_queue: None,
                reader: None,
                writer: None,
            })),
            disp: disp.clone(),
        }
    }

    /// Wraps a descriptor returned by `accept` as a connected socket.
    fn from_accepted(disp: &Dispatcher, fd: RawFd) -> Result<Self, Fail> {
        let neonate = Self::from_raw(disp, fd, SocketState::Open);
        neonate.finish_connect()?;
        Ok(neonate)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.inner.borrow().state
    }

    /// Enables address reuse on the underlying socket.
    pub fn set_reuse_addr(&self) -> Result<(), Fail> {
        let fd = self.inner.borrow().fd;
        socket::setsockopt(fd, sockopt::ReuseAddr, &true).map_err(Fail::from_os)
    }

    /// Binds the socket to a local endpoint.
    pub fn bind(&self, addr: SocketAddrV4) -> Result<(), Fail> {
        trace!("bind(): addr={:?}", addr);
        let fd = self.inner.borrow().fd;
        socket::bind(fd, &to_sockaddr(addr)).map_err(Fail::from_os)
    }

    /// The locally bound endpoint; useful after binding port zero.
    pub fn local_endpoint(&self) -> Result<SocketAddrV4, Fail> {
        let fd = self.inner.borrow().fd;
        match socket::getsockname(fd).map_err(Fail::from_os)? {
            SockAddr::Inet(inet) => match inet.to_std() {
                SocketAddr::V4(addr) => Ok(addr),
                SocketAddr::V6(..) => Err(Fail::Unsupported {
                    details: "IPv6 endpoint",
                }),
            },
            _ => Err(Fail::Unsupported {
                details: "non-inet endpoint",
            }),
        }
    }

    /// Puts the socket into listening mode and creates the acceptance queue.
    pub fn listen(&self, backlog: usize) -> Result<(), Fail> {
        trace!("listen(): backlog={:?}", backlog);
        if backlog == 0 {
            return Err(Fail::Invalid {
                details: "backlog length",
            });
        }
        let mut inner = self.inner.borrow_mut();
        if inner.state != SocketState::Open {
            return Err(Fail::Invalid {
                details: "listen on a socket that is not open",
            });
        }
        let fd = inner.fd;
        socket::listen(fd, backlog).map_err(Fail::from_os)?;

        let disp = self.disp.clone();
        inner.accept_queue = Some(FdEventQueue::new(
            &self.disp,
            fd,
            EpollFlags::EPOLLIN,
            move |_active| match socket::accept4(fd, SockFlag::SOCK_NONBLOCK) {
                Ok(newfd) => {
                    info!("connection accepted!");
                    StreamSocket::from_accepted(&disp, newfd)
                }
                // The remote side gave up before we picked the connection up;
                // wait for the next one.
                Err(nix::Error::Sys(Errno::ECONNABORTED)) => Err(Fail::TryAgain {}),
                Err(e) => {
                    let fail = Fail::from_os(e);
                    if fail != (Fail::TryAgain {}) {
                        warn!("failed to accept connection ({:?})", fail);
                    }
                    Err(fail)
                }
            },
        ));
        inner.state = SocketState::Listening;
        Ok(())
    }

    /// Accepts the next incoming connection, wrapped in its own connected
    /// socket.
    pub fn accept(&self) -> Deferred<StreamSocket> {
        trace!("accept()");
        let inner = self.inner.borrow();
        match (&inner.state, &inner.accept_queue) {
            (SocketState::Listening, Some(queue)) => queue.get(),
            _ => Deferred::failed(
                &self.disp,
                Fail::Invalid {
                    details: "accept on a socket that is not listening",
                },
            ),
        }
    }

    /// Starts a non-blocking connect to `addr`. The returned cell completes
    /// once the connection is established (or refused).
    pub fn connect(&self, addr: SocketAddrV4) -> Deferred<()> {
        trace!("connect(): addr={:?}", addr);
        let fd = {
            let inner = self.inner.borrow();
            if inner.state != SocketState::Open {
                return Deferred::failed(
                    &self.disp,
                    Fail::Invalid {
                        details: "connect on a socket that is not open",
                    },
                );
            }
            inner.fd
        };
        match socket::connect(fd, &to_sockaddr(addr)) {
            Ok(()) => match self.finish_connect() {
                Ok(()) => Deferred::completed(&self.disp, ()),
                Err(e) => Deferred::failed(&self.disp, e),
            },
            Err(nix::Error::Sys(Errno::EINPROGRESS)) => {
                let this = self.clone();
                fd_event(&self.disp, fd, EpollFlags::EPOLLOUT, move |active| {
                    // An error condition means the attempt failed; retrying
                    // the connect surfaces the kernel's errno.
                    if active.contains(EpollFlags::EPOLLERR) {
                        match socket::connect(fd, &to_sockaddr(addr)) {
                            Err(e) => {
                                warn!("failed to establish connection ({:?})", e);
                                Err(connect_failure(e))
                            }
                            Ok(()) => Err(Fail::Invalid {
                                details: "connect error vanished on retry",
                            }),
                        }
                    } else {
                        info!("connection established!");
                        this.finish_connect()
                    }
                })
            }
            Err(e) => Deferred::failed(&self.disp, connect_failure(e)),
        }
    }

    /// Queues `buf` for transmission; the cell resolves with the number of
    /// bytes written once the whole buffer has gone out.
    pub fn send(&self, buf: Bytes) -> Deferred<usize> {
        trace!("send(): length={:?}", buf.len());
        let inner = self.inner.borrow();
        match (&inner.state, &inner.writer) {
            (SocketState::Connected, Some(writer)) => writer.write(buf),
            _ => Deferred::failed(&self.disp, Fail::NotConnected { details: "send" }),
        }
    }

    /// Requests exactly `length` bytes from the peer.
    pub fn recv(&self, length: usize) -> Deferred<Bytes> {
        trace!("recv(): length={:?}", length);
        let inner = self.inner.borrow();
        match (&inner.state, &inner.reader) {
            (SocketState::Connected, Some(reader)) => reader.read(length),
            _ => Deferred::failed(&self.disp, Fail::NotConnected { details: "recv" }),
        }
    }

    /// Requests the next line-feed-terminated block from the peer.
    pub fn recv_line(&self) -> Deferred<Bytes> {
        let inner = self.inner.borrow();
        match (&inner.state, &inner.reader) {
            (SocketState::Connected, Some(reader)) => reader.read_line(),
            _ => Deferred::failed(&self.disp, Fail::NotConnected { details: "recv" }),
        }
    }

    /// Closes the socket gracefully, waiting for pending accepts or pending
    /// sends and receives to drain first.
    pub async fn close(&self) -> Result<(), Fail> {
        trace!("close()");
        let state = self.inner.borrow().state;
        match state {
            SocketState::Listening => {
                self.inner.borrow_mut().state = SocketState::Closing;
                let barrier = {
                    let inner = self.inner.borrow();
                    inner.accept_queue.as_ref().unwrap().close()
                };
                barrier.await;
                self.inner.borrow_mut().accept_queue = None;
                self.finish_close();
                Ok(())
            }
            SocketState::Connected => {
                self.inner.borrow_mut().state = SocketState::Closing;
                // Both releases start before either is awaited so the reader
                // and writer drain in parallel.
                let (read_barrier, write_barrier) = {
                    let inner = self.inner.borrow();
                    (
                        inner.reader.as_ref().unwrap().release(),
                        inner.writer.as_ref().unwrap().release(),
                    )
                };
                write_barrier.await;
                read_barrier.await;
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.reader = None;
                    inner.writer = None;
                }
                self.finish_close();
                Ok(())
            }
            SocketState::Open => {
                self.finish_close();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Cancels every pending operation with `error` and tears the socket
    /// down immediately.
    pub fn force_close(&self, error: Fail) {
        trace!("force_close(): error={:?}", error);
        let state = self.inner.borrow().state;
        match state {
            SocketState::Listening => {
                self.inner.borrow_mut().state = SocketState::Closing;
                let cells = {
                    let inner = self.inner.borrow();
                    inner.accept_queue.as_ref().unwrap().force_close()
                };
                for cell in cells {
                    cell.set_error(error.clone());
                }
                self.inner.borrow_mut().accept_queue = None;
                self.finish_close();
            }
            SocketState::Connected => {
                self.inner.borrow_mut().state = SocketState::Closing;
                let (reader, writer) = {
                    let mut inner = self.inner.borrow_mut();
                    (inner.reader.take(), inner.writer.take())
                };
                if let Some(reader) = reader {
                    reader.force_release(error.clone());
                }
                if let Some(writer) = writer {
                    writer.force_release(error);
                }
                self.finish_close();
            }
            SocketState::Open => self.finish_close(),
            _ => (),
        }
    }

    /// Completes a connection attempt: builds the wrappers and transitions to
    /// connected.
    fn finish_connect(&self) -> Result<(), Fail> {
        let fd = self.inner.borrow().fd;
        let file = StreamFd::new(fd);
        let reader = ReadWrapper::new(&self.disp, file, LOW_WATERMARK, HIGH_WATERMARK)?;
        let writer = WriteWrapper::new(&self.disp, file)?;
        let mut inner = self.inner.borrow_mut();
        inner.reader = Some(reader);
        inner.writer = Some(writer);
        inner.state = SocketState::Connected;
        Ok(())
    }

    fn finish_close(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Err(e) = unistd::close(inner.fd) {
            warn!("failed to close socket ({:?})", e);
        }
        inner.state = SocketState::Closed;
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Clone for StreamSocket {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            disp: self.disp.clone(),
        }
    }
}

/// A socket dying without an explicit close runs the same teardown
/// [force_close](StreamSocket::force_close) performs: the accept queue and
/// the wrappers release their dispatcher registrations and fail their
/// pending operations before the descriptor goes away.
impl Drop for SocketInner {
    fn drop(&mut self) {
        match self.state {
            SocketState::Closed => return,
            SocketState::Open => (),
            state => warn!("socket dropped while {:?}", state),
        }
        if let Some(queue) = self.accept_queue.take() {
            for cell in queue.force_close() {
                cell.set_error(Fail::InterruptedTransfer {
                    details: "socket dropped",
                });
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.force_release(Fail::InterruptedTransfer {
                details: "socket dropped",
            });
        }
        if let Some(writer) = self.writer.take() {
            writer.force_release(Fail::InterruptedTransfer {
                details: "socket dropped",
            });
        }
        if let Err(e) = unistd::close(self.fd) {
            warn!("failed to close socket ({:?})", e);
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
