// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deferred result cells: the fundamental unit of asynchronous control.
//!
//! A cell is a single-assignment slot that is either pending, holds a result,
//! or holds an error. A task that awaits a pending cell suspends and is
//! resumed by the dispatcher when the cell is completed; the completion
//! flavors differ only in where the resumption lands in the dispatcher's
//! queues (head, tail, or synchronously on the current stack).

pub mod barrier;
pub mod gate;

use crate::{dispatcher::Dispatcher, fail::Fail};

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

//==============================================================================
// Constants & Structures
//==============================================================================

enum CellState<T> {
    Pending,
    Ready(T),
    Failed(Fail),
    Consumed,
}

enum CellWaiter<T> {
    /// A suspended task to resume.
    Task(usize),
    /// A forwarding closure, used to chain one cell's completion into
    /// another's.
    Chain(Box<dyn FnOnce(Result<T, Fail>)>),
}

/// Which queue position a completion schedules its resumption at.
enum Tier {
    High,
    Late,
    Fast,
}

struct CellInner<T> {
    state: CellState<T>,
    waiter: Option<CellWaiter<T>>,
    error_accessed: bool,
}

/// A deferred result or error.
///
/// Handles are cheap to clone; the completing side keeps one clone and the
/// awaiting side another. A cell transitions exactly once from pending to
/// result or error and the stored value is consumed exactly once, either by
/// `.await` from inside a task or by [take_result](Self::take_result) from
/// the blocking [wait](crate::dispatcher::Dispatcher::wait) loop.
pub struct Deferred<T> {
    inner: Rc<RefCell<CellInner<T>>>,
    disp: Dispatcher,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Deferred].
impl<T: 'static> Deferred<T> {
    /// Creates a pending cell.
    pub fn new(disp: &Dispatcher) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CellInner {
                state: CellState::Pending,
                waiter: None,
                error_accessed: false,
            })),
            disp: disp.clone(),
        }
    }

    /// Creates a cell that has already completed with `value`. Used by
    /// operations that finish on one branch without suspending.
    pub fn completed(disp: &Dispatcher, value: T) -> Self {
        let cell = Self::new(disp);
        cell.set_result(value);
        cell
    }

    /// Creates a cell that has already failed with `error`.
    pub fn failed(disp: &Dispatcher, error: Fail) -> Self {
        let cell = Self::new(disp);
        cell.set_error(error);
        cell
    }

    /// Completes the cell; a waiting task resumes at the head of the queue.
    pub fn set_result(&self, value: T) {
        self.complete(Ok(value), Tier::High)
    }

    /// Fails the cell; a waiting task resumes at the head of the queue.
    pub fn set_error(&self, error: Fail) {
        self.complete(Err(error), Tier::High)
    }

    /// As [set_result](Self::set_result) but the resumption goes to the tail
    /// of the queue, behind everything currently scheduled.
    pub fn set_result_late(&self, value: T) {
        self.complete(Ok(value), Tier::Late)
    }

    /// As [set_error](Self::set_error) but the resumption goes to the tail of
    /// the queue.
    pub fn set_error_late(&self, error: Fail) {
        self.complete(Err(error), Tier::Late)
    }

    /// Completes the cell and resumes a waiting task synchronously on the
    /// current stack. Intended as a tail call at the end of I/O handlers;
    /// deep completion chains degrade to head-of-queue scheduling.
    pub fn set_result_fast(&self, value: T) {
        self.complete(Ok(value), Tier::Fast)
    }

    /// As [set_error_fast](Self::set_result_fast) for the error case.
    pub fn set_error_fast(&self, error: Fail) {
        self.complete(Err(error), Tier::Fast)
    }

    /// First-past-the-post completion: the first setting wins and later ones
    /// are silently dropped. Returns whether this call was the first.
    pub fn try_set_result(&self, value: T) -> bool {
        if self.is_done() {
            return false;
        }
        self.set_result(value);
        true
    }

    /// First-past-the-post failure; see [try_set_result](Self::try_set_result).
    pub fn try_set_error(&self, error: Fail) -> bool {
        if self.is_done() {
            return false;
        }
        self.set_error(error);
        true
    }

    /// Returns `true` once the cell has completed (or its value was consumed).
    pub fn is_done(&self) -> bool {
        !matches!(self.inner.borrow().state, CellState::Pending)
    }

    /// Consumes the stored result or error. The caller must have established
    /// completion beforehand; retrieving a pending or already-consumed result
    /// is a usage error.
    pub fn take_result(&self) -> Result<T, Fail> {
        let mut inner = self.inner.borrow_mut();
        match std::mem::replace(&mut inner.state, CellState::Consumed) {
            CellState::Ready(value) => Ok(value),
            CellState::Failed(error) => {
                inner.error_accessed = true;
                Err(error)
            }
            CellState::Pending => panic!("result retrieved before completion"),
            CellState::Consumed => panic!("result retrieved twice"),
        }
    }

    /// Installs a forwarding closure invoked with the eventual result. At
    /// most one waiter (task or chain) may be attached to a cell.
    pub(crate) fn on_complete(&self, forward: Box<dyn FnOnce(Result<T, Fail>)>) {
        let mut inner = self.inner.borrow_mut();
        match inner.state {
            CellState::Pending => {
                if inner.waiter.is_some() {
                    panic!("cell already has a waiter");
                }
                inner.waiter = Some(CellWaiter::Chain(forward));
            }
            _ => panic!("chained onto a completed cell"),
        }
    }

    fn complete(&self, result: Result<T, Fail>, tier: Tier) {
        let mut inner = self.inner.borrow_mut();
        if !matches!(inner.state, CellState::Pending) {
            panic!("cell completed twice");
        }
        match inner.waiter.take() {
            Some(CellWaiter::Chain(forward)) => {
                // The value never rests in the cell; delivery through the
                // chain counts as having been observed.
                inner.state = CellState::Consumed;
                drop(inner);
                match tier {
                    Tier::Fast => forward(result),
                    Tier::High => self.disp.schedule_high(move || forward(result)),
                    Tier::Late => self.disp.schedule_medium(move || forward(result)),
                }
            }
            waiter => {
                inner.state = match result {
                    Ok(value) => CellState::Ready(value),
                    Err(error) => {
                        inner.error_accessed = false;
                        CellState::Failed(error)
                    }
                };
                drop(inner);
                if let Some(CellWaiter::Task(id)) = waiter {
                    match tier {
                        Tier::Fast => self.disp.resume_task_now(id),
                        Tier::High => self.disp.resume_task(id),
                        Tier::Late => self.disp.resume_task_late(id),
                    }
                }
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            disp: self.disp.clone(),
        }
    }
}

/// Awaiting a cell from inside a task suspends the task until completion; an
/// already-completed cell returns synchronously.
impl<T: 'static> Future for Deferred<T> {
    type Output = Result<T, Fail>;

    fn poll(self: Pin<&mut Self>, _ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        let mut inner = self_.inner.borrow_mut();
        match std::mem::replace(&mut inner.state, CellState::Consumed) {
            CellState::Pending => {
                inner.state = CellState::Pending;
                let current = self_
                    .disp
                    .current_task()
                    .expect("deferred cell awaited outside a dispatcher task");
                match &inner.waiter {
                    Some(CellWaiter::Chain(..)) => panic!("cell already has a waiter"),
                    Some(CellWaiter::Task(id)) if *id != current => {
                        panic!("cell already has a waiter")
                    }
                    _ => (),
                }
                inner.waiter = Some(CellWaiter::Task(current));
                Poll::Pending
            }
            CellState::Ready(value) => Poll::Ready(Ok(value)),
            CellState::Failed(error) => {
                inner.error_accessed = true;
                Poll::Ready(Err(error))
            }
            CellState::Consumed => panic!("cell polled after completion"),
        }
    }
}

/// Silent-error mitigation: destroying a cell whose error was never observed
/// is surfaced noisily.
impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        if let CellState::Failed(error) = &self.state {
            if !self.error_accessed {
                if std::thread::panicking() {
                    error!("error failed silently at cell destruction: {}", error);
                } else {
                    panic!("error failed silently at cell destruction: {}", error);
                }
            }
        }
    }
}

/// Debug trait implementation for [Deferred].
impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.inner.borrow().state {
            CellState::Pending => "pending",
            CellState::Ready(..) => "ready",
            CellState::Failed(..) => "failed",
            CellState::Consumed => "consumed",
        };
        write!(f, "Deferred({})", state)
    }
}

//==============================================================================
// Control Yield
//==============================================================================

/// Future returned by [yield_low]; parks the task on the low-priority queue
/// once, then completes.
pub struct LowYield {
    disp: Dispatcher,
    parked: bool,
}

/// Yields control to the event loop at low priority: the task resumes only
/// when the dispatcher would otherwise idle, after a non-blocking poll of the
/// multiplexer.
pub fn yield_low(disp: &Dispatcher) -> LowYield {
    LowYield {
        disp: disp.clone(),
        parked: false,
    }
}

impl Future for LowYield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _ctx: &mut Context) -> Poll<()> {
        let self_ = self.get_mut();
        if self_.parked {
            Poll::Ready(())
        } else {
            let current = self_
                .disp
                .current_task()
                .expect("yield_low outside a dispatcher task");
            self_.parked = true;
            self_.disp.park_task_low(current);
            Poll::Pending
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that a completed cell returns synchronously.
    #[test]
    fn completed_cell() {
        let disp = Dispatcher::new().unwrap();
        let cell = Deferred::completed(&disp, 7u32);
        assert!(cell.is_done());
        assert_eq!(cell.take_result().unwrap(), 7);
    }

    /// Tests that resolving a cell resumes the awaiting task.
    #[test]
    fn resolve_resumes_waiter() {
        let disp = Dispatcher::new().unwrap();
        let cell: Deferred<u32> = Deferred::new(&disp);
        let producer = cell.clone();
        disp.schedule_medium(move || producer.set_result(42));
        let value = disp.run(async move { cell.await }).unwrap();
        assert_eq!(value, 42);
    }

    /// Tests that errors propagate to the awaiting task.
    #[test]
    fn error_propagates() {
        let disp = Dispatcher::new().unwrap();
        let cell: Deferred<u32> = Deferred::new(&disp);
        let producer = cell.clone();
        disp.schedule_medium(move || producer.set_error(Fail::StreamClosed {}));
        let result = disp.run(async move { cell.await });
        assert_eq!(result, Err(Fail::StreamClosed {}));
    }

    /// Tests head-versus-tail resumption order: a late completion resumes its
    /// waiter behind a head completion made after it.
    #[test]
    fn late_completion_resumes_last() {
        let disp = Dispatcher::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let cell_a: Deferred<()> = Deferred::new(&disp);
        let cell_b: Deferred<()> = Deferred::new(&disp);
        for (cell, name) in &[(cell_a.clone(), "a"), (cell_b.clone(), "b")] {
            let cell = cell.clone();
            let name = *name;
            let log = order.clone();
            let _ = disp.spawn(async move {
                cell.await?;
                log.borrow_mut().push(name);
                Ok(())
            });
        }
        disp.flush();

        cell_a.set_result_late(());
        cell_b.set_result(());
        disp.flush();
        assert_eq!(*order.borrow(), vec!["b", "a"]);
    }

    /// Tests the first-past-the-post completion mode.
    #[test]
    fn first_past_the_post() {
        let disp = Dispatcher::new().unwrap();
        let cell: Deferred<u32> = Deferred::new(&disp);
        assert!(cell.try_set_result(1));
        assert!(!cell.try_set_result(2));
        assert!(!cell.try_set_error(Fail::StreamClosed {}));
        assert_eq!(cell.take_result().unwrap(), 1);
    }

    /// Tests that a cell resolves at most once.
    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_rejected() {
        let disp = Dispatcher::new().unwrap();
        let cell: Deferred<u32> = Deferred::new(&disp);
        cell.set_result(1);
        cell.set_result(2);
    }

    /// Tests that dropping a never-observed error is loud.
    #[test]
    #[should_panic(expected = "failed silently")]
    fn silent_error_detected() {
        let disp = Dispatcher::new().unwrap();
        let cell: Deferred<u32> = Deferred::failed(&disp, Fail::StreamClosed {});
        drop(cell);
    }

    /// Tests that low-priority yields run only once the main queue idles.
    #[test]
    fn low_yield_defers() {
        let disp = Dispatcher::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        let yielder = disp.clone();
        let _ = disp.spawn(async move {
            yield_low(&yielder).await;
            log.borrow_mut().push("resumed");
            Ok(())
        });
        let log = order.clone();
        disp.schedule_medium(move || log.borrow_mut().push("callback"));

        disp.flush();
        assert_eq!(*order.borrow(), vec!["callback"]);
        disp.run_next();
        assert_eq!(*order.borrow(), vec!["callback", "resumed"]);
    }
}
