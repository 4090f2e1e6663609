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

/// One pending application read.
enum ReadRequest {
    /// Exactly this many bytes.
    Exact(usize),
    /// Up to and including the next line feed.
    Line,
}

struct ReadInner {
    file: StreamFd,
    buf: VecDeque<Bytes>,
    buf_size: usize,
    low_watermark: usize,
    high_watermark: usize,
    waiters: VecDeque<(Deferred<Bytes>, ReadRequest)>,
    waiting_size: usize,
    closing: Option<Barrier>,
    registered: bool,
    disp: Dispatcher,
}

/// Buffered read adapter over a non-blocking descriptor.
///
/// A bounded buffer sits between the operating system and application reads:
/// the readable callback feeds OS data into the waiter chain in strict
/// enqueue order, buffers the remainder, and pauses OS reads while the buffer
/// sits at or above the high watermark.
pub struct ReadWrapper {
    inner: Rc<RefCell<ReadInner>>,
    disp: Dispatcher,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [ReadWrapper].
impl ReadWrapper {
    /// Creates a read wrapper and puts the descriptor into non-blocking mode.
    /// With a positive high watermark the reader arms immediately and buffers
    /// ahead of demand.
    pub fn new(
        disp: &Dispatcher,
        file: StreamFd,
        low_watermark: usize,
        high_watermark: usize,
    ) -> Result<Self, Fail> {
        set_nonblocking(file.fd())?;
        let wrapper = Self {
            inner: Rc::new(RefCell::new(ReadInner {
                file,
                buf: VecDeque::new(),
                buf_size: 0,
                low_watermark,
                high_watermark,
                waiters: VecDeque::new(),
                waiting_size: 0,
                closing: None,
                registered: false,
                disp: disp.clone(),
            })),
            disp: disp.clone(),
        };
        if high_watermark > 0 {
            wrapper.register_reader();
        }
        Ok(wrapper)
    }

    /// Requests exactly `length` bytes. A request the buffer can satisfy in
    /// full completes immediately without touching the OS.
    pub fn read(&self, length: usize) -> Deferred<Bytes> {
        trace!("read(): length={:?}", length);
        let mut inner = self.inner.borrow_mut();
        if inner.closing.is_some() {
            return Deferred::failed(
                &self.disp,
                Fail::InterruptedTransfer {
                    details: "read on released wrapper",
                },
            );
        }
        if inner.waiters.is_empty() && inner.buf_size >= length {
            let block = Self::carve(&mut inner.buf, length);
            inner.buf_size -= length;
            let rearm = !inner.registered && inner.buf_size < inner.low_watermark;
            drop(inner);
            if rearm {
                self.register_reader();
            }
            Deferred::completed(&self.disp, block)
        } else {
            let cell = Deferred::new(&self.disp);
            inner.waiting_size += length;
            inner.waiters.push_back((cell.clone(), ReadRequest::Exact(length)));
            let arm = !inner.registered;
            drop(inner);
            if arm {
                self.register_reader();
            }
            cell
        }
    }

    /// Requests a line-feed-terminated block; the line feed is included in
    /// the delivered bytes.
    pub fn read_line(&self) -> Deferred<Bytes> {
        trace!("read_line()");
        let mut inner = self.inner.borrow_mut();
        if inner.closing.is_some() {
            return Deferred::failed(
                &self.disp,
                Fail::InterruptedTransfer {
                    details: "read on released wrapper",
                },
            );
        }
        if inner.waiters.is_empty() && inner.buf_size > 0 {
            let blob = Self::coalesce(&mut inner.buf);
            if let Some(index) = blob.find_byte(b'\n') {
                let mut rest = blob;
                let line = rest.split_to(index + 1);
                inner.buf_size -= line.len();
                if !rest.is_empty() {
                    inner.buf.push_back(rest);
                }
                return Deferred::completed(&self.disp, line);
            }
            inner.buf.push_back(blob);
        }
        let cell = Deferred::new(&self.disp);
        inner.waiters.push_back((cell.clone(), ReadRequest::Line));
        let arm = !inner.registered;
        drop(inner);
        if arm {
            self.register_reader();
        }
        cell
    }

    /// Reads a packet prefixed by a 1-byte big-endian length.
    pub async fn read_packet1(&self) -> Result<Bytes, Fail> {
        let header = self.read(1).await?;
        let length = header[0] as usize;
        self.read(length).await
    }

    /// Reads a packet prefixed by a 2-byte big-endian length.
    pub async fn read_packet2(&self) -> Result<Bytes, Fail> {
        let header = self.read(2).await?;
        let length = BigEndian::read_u16(&header) as usize;
        self.read(length).await
    }

    /// Reads a packet prefixed by a 4-byte big-endian length.
    pub async fn read_packet4(&self) -> Result<Bytes, Fail> {
        let header = self.read(4).await?;
        let length = BigEndian::read_u32(&header) as usize;
        self.read(length).await
    }

    /// Releases control of the underlying descriptor. The returned barrier
    /// opens once every read already queued has been satisfied. Idempotent.
    pub fn release(&self) -> Barrier {
        let mut inner = self.inner.borrow_mut();
        if let Some(barrier) = &inner.closing {
            return barrier.clone();
        }
        let barrier = Barrier::new(&self.disp);
        inner.closing = Some(barrier.clone());
        let finish = inner.waiters.is_empty();
        drop(inner);
        if finish {
            Self::complete_release(&self.inner, &self.disp);
        }
        barrier
    }

    /// Releases immediately, failing every queued read with `error`.
    pub fn force_release(&self, error: Fail) {
        let cells: Vec<Deferred<Bytes>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.closing.is_none() {
                inner.closing = Some(Barrier::new(&self.disp));
            }
            inner.waiting_size = 0;
            inner.waiters.drain(..).map(|(cell, _)| cell).collect()
        };
        for cell in cells {
            cell.set_error(error.clone());
        }
        Self::complete_release(&self.inner, &self.disp);
    }

    fn register_reader(&self) {
        self.inner.borrow_mut().registered = true;
        let fd = self.inner.borrow().file.fd();
        // The handle table must not keep the wrapper alive, or a wrapper
        // dropped without release could never balance its registration.
        let weak = Rc::downgrade(&self.inner);
        let disp = self.disp.clone();
        self.disp.register_fd(
            fd,
            EpollFlags::EPOLLIN,
            Rc::new(move |active| {
                if let Some(inner) = weak.upgrade() {
                    Self::handle_readable(&inner, &disp, active);
                }
            }),
        );
    }

    fn unregister_reader(inner_rc: &Rc<RefCell<ReadInner>>, disp: &Dispatcher) {
        let fd = {
            let mut inner = inner_rc.borrow_mut();
            inner.registered = false;
            inner.file.fd()
        };
        disp.unregister_fd(fd, EpollFlags::EPOLLIN);
    }

    /// Readable callback: pull a budgeted block from the OS, feed the waiter
    /// chain, then apply release and backpressure rules.
    fn handle_readable(inner_rc: &Rc<RefCell<ReadInner>>, disp: &Dispatcher, active: EpollFlags) {
        let outcome: Result<Bytes, Fail> = {
            let inner = inner_rc.borrow();
            if active.contains(EpollFlags::EPOLLERR) {
                Err(Fail::InterruptedTransfer {
                    details: "error condition on file descriptor",
                })
            } else if active.contains(EpollFlags::EPOLLHUP) {
                Err(Fail::StreamClosed {})
            } else {
                let budget = match inner.waiters.front() {
                    Some((_, ReadRequest::Line)) => inner.high_watermark,
                    _ => inner.waiting_size + inner.high_watermark - inner.buf_size,
                };
                inner.file.read(budget)
            }
        };

        match outcome {
            // Readiness without data; keep the registration and wait.
            Err(Fail::TryAgain {}) => (),
            Err(error) => {
                let head = {
                    let mut inner = inner_rc.borrow_mut();
                    match inner.waiters.pop_front() {
                        Some((cell, ReadRequest::Exact(length))) => {
                            inner.waiting_size -= length;
                            Some(cell)
                        }
                        Some((cell, ReadRequest::Line)) => Some(cell),
                        None => None,
                    }
                };
                if let Some(cell) = head {
                    cell.set_error(error);
                }
                Self::settle(inner_rc, disp, true);
            }
            Ok(data) => {
                let resolved = {
                    let mut inner = inner_rc.borrow_mut();
                    Self::fill_waiters(&mut inner, data)
                };
                for (cell, block) in resolved {
                    cell.set_result(block);
                }
                Self::settle(inner_rc, disp, false);
            }
        }
    }

    /// Post-callback bookkeeping: complete a pending release once the waiter
    /// chain empties, or pause OS reads under backpressure.
    fn settle(inner_rc: &Rc<RefCell<ReadInner>>, disp: &Dispatcher, failed: bool) {
        enum Action {
            CompleteRelease,
            Unregister,
            Keep,
        }
        let action = {
            let inner = inner_rc.borrow();
            if inner.registered && inner.waiters.is_empty() {
                if inner.closing.is_some() {
                    Action::CompleteRelease
                } else if failed || inner.buf_size >= inner.high_watermark {
                    Action::Unregister
                } else {
                    Action::Keep
                }
            } else {
                Action::Keep
            }
        };
        match action {
            Action::CompleteRelease => Self::complete_release(inner_rc, disp),
            Action::Unregister => Self::unregister_reader(inner_rc, disp),
            Action::Keep => (),
        }
    }

    fn complete_release(inner_rc: &Rc<RefCell<ReadInner>>, disp: &Dispatcher) {
        let registered = inner_rc.borrow().registered;
        if registered {
            Self::unregister_reader(inner_rc, disp);
        }
        let barrier = inner_rc
            .borrow()
            .closing
            .clone()
            .expect("release completed before it began");
        if !barrier.is_released() {
            barrier.release();
        }
    }

    /// Streams buffered data plus the freshly read block into the waiter
    /// chain, stopping at the first waiter that cannot be satisfied. Returns
    /// the cells to resolve; leftover data stays buffered.
    fn fill_waiters(inner: &mut ReadInner, data: Bytes) -> Vec<(Deferred<Bytes>, Bytes)> {
        let mut chunks = std::mem::take(&mut inner.buf);
        let mut total = inner.buf_size + data.len();
        if !data.is_empty() {
            chunks.push_back(data);
        }

        let mut resolved = Vec::new();
        while let Some((_, request)) = inner.waiters.front() {
            match request {
                ReadRequest::Exact(length) if *length <= total => {
                    let length = *length;
                    let block = Self::carve(&mut chunks, length);
                    total -= length;
                    inner.waiting_size -= length;
                    let (cell, _) = inner.waiters.pop_front().unwrap();
                    resolved.push((cell, block));
                }
                ReadRequest::Line => {
                    let blob = Self::coalesce(&mut chunks);
                    match blob.find_byte(b'\n') {
                        Some(index) => {
                            let mut rest = blob;
                            let line = rest.split_to(index + 1);
                            total -= line.len();
                            if !rest.is_empty() {
                                chunks.push_back(rest);
                            }
                            let (cell, _) = inner.waiters.pop_front().unwrap();
                            resolved.push((cell, line));
                        }
                        None => {
                            if !blob.is_empty() {
                                chunks.push_back(blob);
                            }
                            break;
                        }
                    }
                }
                ReadRequest::Exact(..) => break,
            }
        }

        inner.buf = chunks;
        inner.buf_size = total;
        resolved
    }

    /// Removes exactly `length` bytes from the front of the chunk list.
    fn carve(chunks: &mut VecDeque<Bytes>, length: usize) -> Bytes {
        if length == 0 {
            return Bytes::empty();
        }
        if let Some(front) = chunks.front_mut() {
            if front.len() > length {
                return front.split_to(length);
            }
            if front.len() == length {
                return chunks.pop_front().unwrap();
            }
        }
        let mut out: Vec<u8> = Vec::with_capacity(length);
        let mut remaining = length;
        while remaining > 0 {
            let mut chunk = chunks.pop_front().expect("read buffer underflow");
            if chunk.len() > remaining {
                let head = chunk.split_to(remaining);
                out.extend_from_slice(&head);
                chunks.push_front(chunk);
                remaining = 0;
            } else {
                remaining -= chunk.len();
                out.extend_from_slice(&chunk);
            }
        }
        Bytes::from_vec(out)
    }

    /// Collapses the chunk list into a single contiguous block.
    fn coalesce(chunks: &mut VecDeque<Bytes>) -> Bytes {
        match chunks.len() {
            0 => Bytes::empty(),
            1 => chunks.pop_front().unwrap(),
            _ => {
                let blob = Bytes::concat(chunks.iter());
                chunks.clear();
                blob
            }
        }
    }
}

impl Clone for ReadWrapper {
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
/// [force_release](ReadWrapper::force_release) would: pending reads fail,
/// the registration is balanced, and the close barrier opens.
impl Drop for ReadInner {
    fn drop(&mut self) {
        let released = matches!(&self.closing, Some(barrier) if barrier.is_released());
        if !released {
            warn!("read wrapper dropped without release");
        }
        self.waiting_size = 0;
        for (cell, _) in self.waiters.drain(..) {
            cell.set_error(Fail::InterruptedTransfer {
                details: "read wrapper dropped",
            });
        }
        if self.registered {
            self.registered = false;
            self.disp.unregister_fd(self.file.fd(), EpollFlags::EPOLLIN);
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
