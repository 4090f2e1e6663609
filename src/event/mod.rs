// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cells tied to file-descriptor readiness.
//!
//! Handlers run from the dispatcher when the multiplexer reports readiness.
//! A handler signals "nothing was actually available" by returning
//! [Fail::TryAgain], which preserves the registration; any other return tears
//! the registration down and completes the waiting cell.

use crate::{
    cell::{barrier::Barrier, Deferred},
    dispatcher::Dispatcher,
    fail::Fail,
};

use nix::sys::epoll::EpollFlags;

use std::{cell::RefCell, collections::VecDeque, os::unix::io::RawFd, rc::Rc};

//==============================================================================
// FD Event
//==============================================================================

/// Registers `(fd, mask)` and returns a cell that completes on the first
/// readiness event the handler accepts.
///
/// The handler receives the effective readiness mask. Returning
/// `Err(Fail::TryAgain)` keeps the registration alive and the cell pending;
/// any other result unregisters and completes the cell synchronously.
pub fn fd_event<T, F>(disp: &Dispatcher, fd: RawFd, mask: EpollFlags, handler: F) -> Deferred<T>
where
    T: 'static,
    F: Fn(EpollFlags) -> Result<T, Fail> + 'static,
{
    let cell = Deferred::new(disp);
    let completion = cell.clone();
    let registration = disp.clone();
    disp.register_fd(
        fd,
        mask,
        Rc::new(move |active: EpollFlags| match handler(active) {
            Err(Fail::TryAgain {}) => (),
            Ok(value) => {
                registration.unregister_fd(fd, mask);
                completion.set_result_fast(value);
            }
            Err(error) => {
                registration.unregister_fd(fd, mask);
                completion.set_error_fast(error);
            }
        }),
    );
    cell
}

//==============================================================================
// FD Event Queue
//==============================================================================

struct EventQueueInner<T> {
    queue: VecDeque<Deferred<T>>,
    closing: bool,
    fd: RawFd,
    mask: EpollFlags,
    disp: Dispatcher,
}

/// A queue of cells fulfilled one-per-readiness-event from a file descriptor.
///
/// The `(fd, mask)` registration exists exactly while the queue is non-empty,
/// so the event system never works on behalf of nobody. Closing is graceful:
/// no new `get`s are accepted and the close barrier releases once the queue
/// drains.
pub struct FdEventQueue<T> {
    inner: Rc<RefCell<EventQueueInner<T>>>,
    handler: Rc<dyn Fn(EpollFlags) -> Result<T, Fail>>,
    close_barrier: Barrier,
}

/// Associate functions for [FdEventQueue].
impl<T: 'static> FdEventQueue<T> {
    /// Creates an event queue over `(fd, mask)`; nothing is registered until
    /// the first [get](Self::get).
    pub fn new<F>(disp: &Dispatcher, fd: RawFd, mask: EpollFlags, handler: F) -> Self
    where
        F: Fn(EpollFlags) -> Result<T, Fail> + 'static,
    {
        Self {
            inner: Rc::new(RefCell::new(EventQueueInner {
                queue: VecDeque::new(),
                closing: false,
                fd,
                mask,
                disp: disp.clone(),
            })),
            handler: Rc::new(handler),
            close_barrier: Barrier::new(disp),
        }
    }

    /// Requests the next object from the event system. Fails immediately on a
    /// closing queue.
    pub fn get(&self) -> Deferred<T> {
        let mut inner = self.inner.borrow_mut();
        if inner.closing {
            return Deferred::failed(&inner.disp, Fail::QueueClosed {});
        }
        let cell = Deferred::new(&inner.disp);
        inner.queue.push_back(cell.clone());
        if inner.queue.len() == 1 {
            let (fd, mask, disp) = (inner.fd, inner.mask, inner.disp.clone());
            drop(inner);
            disp.register_fd(fd, mask, self.event_handle());
        }
        cell
    }

    /// Closes the queue gracefully. New `get`s are refused; the returned
    /// barrier releases once every cell already in the queue has been
    /// fulfilled. Re-entry returns the same barrier.
    pub fn close(&self) -> Barrier {
        let mut inner = self.inner.borrow_mut();
        if inner.closing {
            return self.close_barrier.clone();
        }
        inner.closing = true;
        if inner.queue.is_empty() {
            self.close_barrier.release();
        }
        self.close_barrier.clone()
    }

    /// Closes the queue prematurely, releasing the close barrier at once and
    /// yielding every pending cell so the caller can assign errors (or
    /// results) to them.
    pub fn force_close(&self) -> Vec<Deferred<T>> {
        let mut inner = self.inner.borrow_mut();
        if !inner.queue.is_empty() {
            let disp = inner.disp.clone();
            disp.unregister_fd(inner.fd, inner.mask);
        }
        inner.closing = true;
        if !self.close_barrier.is_released() {
            self.close_barrier.release();
        }
        inner.queue.drain(..).collect()
    }

    /// Builds the handler registered with the dispatcher: consume the head
    /// cell, fulfill it through the inner handler, and drop the registration
    /// once the queue empties. The handle table must not keep the queue
    /// alive, so the handler holds a weak reference.
    fn event_handle(&self) -> Rc<dyn Fn(EpollFlags)> {
        let weak = Rc::downgrade(&self.inner);
        let handler = self.handler.clone();
        let close_barrier = self.close_barrier.clone();
        Rc::new(move |active: EpollFlags| {
            let inner_rc = match weak.upgrade() {
                Some(inner_rc) => inner_rc,
                None => return,
            };
            let cell = match inner_rc.borrow_mut().queue.pop_front() {
                Some(cell) => cell,
                None => return,
            };
            match handler(active) {
                // No object was available in spite of the readiness report;
                // the cell goes back to the head of the queue.
                Err(Fail::TryAgain {}) => {
                    inner_rc.borrow_mut().queue.push_front(cell);
                    return;
                }
                Ok(value) => cell.set_result(value),
                Err(error) => cell.set_error(error),
            }
            let inner = inner_rc.borrow();
            if inner.queue.is_empty() {
                if inner.closing {
                    close_barrier.release();
                }
                inner.disp.unregister_fd(inner.fd, inner.mask);
            }
        })
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// The registration exists exactly while the queue is non-empty; a queue
/// dying with requests still pending must balance it the way
/// [force_close](FdEventQueue::force_close) does.
impl<T> Drop for EventQueueInner<T> {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            warn!("event queue dropped with requests pending");
            self.disp.unregister_fd(self.fd, self.mask);
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    /// A queue dropped with requests pending still balances its registration
    /// (the dispatcher asserts that when it drops).
    #[test]
    fn drop_with_pending_requests_unregisters() {
        let disp = Dispatcher::new().unwrap();
        let (rx, tx) = unistd::pipe().unwrap();
        let queue: FdEventQueue<u8> = FdEventQueue::new(&disp, rx, EpollFlags::EPOLLIN, |_| Ok(1));

        let pending = queue.get();
        drop(queue);
        assert!(!pending.is_done());
        drop(pending);

        unistd::close(rx).unwrap();
        unistd::close(tx).unwrap();
    }
}
