// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::{set_nonblocking, StreamFd};
use crate::{
    cell::{barrier::Barrier, Deferred},
    collections::bytes::Bytes,
    dispatcher::Dispatcher,
    fail::Fail,
};

use byteorder::{BigEndian, ByteOrder};
use nix::sys::epoll::EpollFlags;

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

struct WriteInner {
    file: StreamFd,
    // Each waiter keeps its unwritten remainder and the original length that
    // its cell resolves with.
    waiters: VecDeque<(Deferred<usize>, Bytes, usize)>,
    pending: usize,
    closing: Option<Barrier>,
    registered: bool,
    disp: Dispatcher,
}

/// Write adapter over a non-blocking descriptor.
///
/// Writes queue their (already allocated) buffers and return a cell that
/// completes once the data has fully left for the OS. The writable callback
/// drains waiters head-first and the writer is registered with the dispatcher
/// exactly while data is pending.
pub struct WriteWrapper {
    inner: Rc<RefCell<WriteInner>>,
    disp: Dispatcher,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [WriteWrapper].
impl WriteWrapper {
    /// Creates a write wrapper and puts the descriptor into non-blocking
    /// mode.
    pub fn new(disp: &Dispatcher, file: StreamFd) -> Result<Self, Fail> {
        set_nonblocking(file.fd())?;
        Ok(Self {
            inner: Rc::new(RefCell::new(WriteInner {
                file,
                waiters: VecDeque::new(),
                pending: 0,
                closing: None,
                registered: false,
                disp: disp.clone(),
            })),
            disp: disp.clone(),
        })
    }

    /// Queues `buf` for transmission. The returned cell resolves with the
    /// buffer's length once it has been written in full; an empty buffer
    /// resolves immediately with zero.
    pub fn write(&self, buf: Bytes) -> Deferred<usize> {
        trace!("write(): length={:?}", buf.len());
        let mut inner = self.inner.borrow_mut();
        if inner.closing.is_some() {
            return Deferred::failed(
                &self.disp,
                Fail::InterruptedTransfer {
                    details: "write on released wrapper",
                },
            );
        }
        if buf.is_empty() {
            return Deferred::completed(&self.disp, 0);
        }
        let cell = Deferred::new(&self.disp);
        let arm = inner.pending == 0;
        let length = buf.len();
        inner.pending += length;
        inner.waiters.push_back((cell.clone(), buf, length));
        drop(inner);
        if arm {
            self.register_writer();
        }
        cell
    }

    /// Writes a packet prefixed by a 1-byte big-endian length.
    pub fn write_packet1(&self, packet: &[u8]) -> Deferred<usize> {
        let mut framed = Vec::with_capacity(packet.len() + 1);
        framed.push(packet.len() as u8);
        framed.extend_from_slice(packet);
        self.write(Bytes::from_vec(framed))
    }

    /// Writes a packet prefixed by a 2-byte big-endian length.
    pub fn write_packet2(&self, packet: &[u8]) -> Deferred<usize> {
        let mut header = [0u8; 2];
        BigEndian::write_u16(&mut header, packet.len() as u16);
        let mut framed = Vec::with_capacity(packet.len() + 2);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(packet);
        self.write(Bytes::from_vec(framed))
    }

    /// Writes a packet prefixed by a 4-byte big-endian length.
    pub fn write_packet4(&self, packet: &[u8]) -> Deferred<usize> {
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, packet.len() as u32);
        let mut framed = Vec::with_capacity(packet.len() + 4);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(packet);
        self.write(Bytes::from_vec(framed))
    }

    /// Releases control of the underlying descriptor once every queued write
    /// has drained. Idempotent.
    pub fn release(&self) -> Barrier {
        let mut inner = self.inner.borrow_mut();
        if let Some(barrier) = &inner.closing {
            return barrier.clone();
        }
        let barrier = Barrier::new(&self.disp);
        inner.closing = Some(barrier.clone());
        if inner.waiters.is_empty() {
            barrier.release();
        }
        barrier
    }

    /// Releases immediately, failing every queued write with `error`.
    pub fn force_release(&self, error: Fail) {
        let (cells, unregister) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closing.is_none() {
                inner.closing = Some(Barrier::new(&self.disp));
            }
            let unregister = inner.registered;
            inner.pending = 0;
            inner.registered = false;
            let cells: Vec<Deferred<usize>> =
                inner.waiters.drain(..).map(|(cell, _, _)| cell).collect();
            (cells, unregister)
        };
        if unregister {
            let fd = self.inner.borrow().file.fd();
            self.disp.unregister_fd(fd, EpollFlags::EPOLLOUT);
        }
        for cell in cells {
            cell.set_error(error.clone());
        }
        let barrier = self.inner.borrow().closing.clone().unwrap();
        if !barrier.is_released() {
            barrier.release();
        }
    }

    fn register_writer(&self) {
        self.inner.borrow_mut().registered = true;
        let fd = self.inner.borrow().file.fd();
        // The handle table must not keep the wrapper alive, or a wrapper
        // dropped without release could never balance its registration.
        let weak = Rc::downgrade(&self.inner);
        let disp = self.disp.clone();
        self.disp.register_fd(
            fd,
            EpollFlags::EPOLLOUT,
            Rc::new(move |active| {
                if let Some(inner) = weak.upgrade() {
                    Self::handle_writable(&inner, &disp, active);
                }
            }),
        );
    }

    /// Writable callback: drain waiters head-first, flush once after the
    /// drain, resolve fully-written waiters, and unregister once nothing is
    /// pending. A failure strikes every waiter that shared this drain's
    /// flush boundary: the ones already written plus the partial head.
    fn handle_writable(inner_rc: &Rc<RefCell<WriteInner>>, disp: &Dispatcher, active: EpollFlags) {
        enum Outcome {
            Drained(usize),
            Failed(usize, Fail),
        }

        let old_pending = inner_rc.borrow().pending;
        let outcome = {
            let mut inner = inner_rc.borrow_mut();
            if active.contains(EpollFlags::EPOLLERR) {
                Outcome::Failed(
                    0,
                    Fail::InterruptedTransfer {
                        details: "error condition on file descriptor",
                    },
                )
            } else if active.contains(EpollFlags::EPOLLHUP) {
                Outcome::Failed(0, Fail::StreamClosed {})
            } else {
                let inner = &mut *inner;
                let mut done = 0;
                let mut failure = None;
                while inner.pending > 0 && done < inner.waiters.len() {
                    let file = inner.file;
                    let (_, remaining, _) = &mut inner.waiters[done];
                    match file.write(&remaining[..]) {
                        Ok(nbytes) => {
                            inner.pending -= nbytes;
                            if nbytes < remaining.len() {
                                remaining.adjust(nbytes);
                                break;
                            }
                            done += 1;
                        }
                        // The descriptor stopped accepting data mid-drain;
                        // keep the waiter and wait for the next event.
                        Err(Fail::TryAgain {}) => break,
                        Err(error) => {
                            failure = Some(error);
                            break;
                        }
                    }
                }
                match failure {
                    Some(error) => Outcome::Failed(done, error),
                    None => match inner.file.flush() {
                        Ok(()) => Outcome::Drained(done),
                        Err(error) => Outcome::Failed(done, error),
                    },
                }
            }
        };

        match outcome {
            Outcome::Drained(done) => {
                let resolved: Vec<(Deferred<usize>, usize)> = {
                    let mut inner = inner_rc.borrow_mut();
                    (0..done)
                        .map(|_| {
                            let (cell, _, length) = inner.waiters.pop_front().unwrap();
                            (cell, length)
                        })
                        .collect()
                };
                for (cell, length) in resolved {
                    cell.set_result(length);
                }
            }
            Outcome::Failed(done, error) => {
                let failed: Vec<Deferred<usize>> = {
                    let mut inner = inner_rc.borrow_mut();
                    // Entries before `done` were fully written and already
                    // left the pending count; only the failed head still
                    // carries unwritten bytes.
                    if let Some((_, remaining, _)) = inner.waiters.get(done) {
                        let unwritten = remaining.len();
                        inner.pending -= unwritten.min(inner.pending);
                    }
                    let strike = (done + 1).min(inner.waiters.len());
                    (0..strike)
                        .map(|_| inner.waiters.pop_front().unwrap().0)
                        .collect()
                };
                for cell in failed {
                    cell.set_error(error.clone());
                }
            }
        }

        let finish = {
            let inner = inner_rc.borrow();
            inner.pending == 0 && old_pending > 0 && inner.registered
        };
        if finish {
            let (fd, barrier) = {
                let mut inner = inner_rc.borrow_mut();
                inner.registered = false;
                (inner.file.fd(), inner.closing.clone())
            };
            disp.unregister_fd(fd, EpollFlags::EPOLLOUT);
            if let Some(barrier) = barrier {
                barrier.release_fast();
            }
        }
    }
}

impl Clone for WriteWrapper {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            disp: self.disp.clone(),
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// A wrapper dying without a release tears itself down the way
/// [force_release](WriteWrapper::force_release) would: pending writes fail,
/// the registration is balanced, and the close barrier opens.
impl Drop for WriteInner {
    fn drop(&mut self) {
        let released = matches!(&self.closing, Some(barrier) if barrier.is_released());
        if !released {
            warn!("write wrapper dropped without release");
        }
        self.pending = 0;
        for (cell, _, _) in self.waiters.drain(..) {
            cell.set_error(Fail::InterruptedTransfer {
                details: "write wrapper dropped",
            });
        }
        if self.registered {
            self.registered = false;
            self.disp.unregister_fd(self.file.fd(), EpollFlags::EPOLLOUT);
        }
        if let Some(barrier) = &self.closing {
            if !barrier.is_released() {
                barrier.release();
            }
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
