// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{cell::Deferred, dispatcher::Dispatcher, fail::Fail};

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

//==============================================================================
// Error Gate
//==============================================================================

/// Number of hook operations between compactions of the proxy list.
const COMPACTION_SCHEDULE: usize = 20;

struct GateInner<T> {
    error: Option<Fail>,
    proxies: Vec<Deferred<T>>,
    hook_count: usize,
}

/// Injects an error past other cells into their waiting tasks.
///
/// Every cell passed through [hook](Self::hook) is wrapped in a
/// first-past-the-post proxy that mirrors the cell's completion. When the
/// gate is tripped, every proxy that has not completed yet fails with the
/// gate's error instead. The proxy list is compacted periodically so a
/// long-lived gate does not grow without bound.
pub struct ErrorGate<T> {
    inner: Rc<RefCell<GateInner<T>>>,
    disp: Dispatcher,
}

/// Associate functions for [ErrorGate].
impl<T: 'static> ErrorGate<T> {
    /// Creates an untripped gate.
    pub fn new(disp: &Dispatcher) -> Self {
        Self {
            inner: Rc::new(RefCell::new(GateInner {
                error: None,
                proxies: Vec::new(),
                hook_count: 0,
            })),
            disp: disp.clone(),
        }
    }

    /// Returns `true` once the gate has been tripped.
    pub fn is_tripped(&self) -> bool {
        self.inner.borrow().error.is_some()
    }

    /// Wraps `cell` so that the returned proxy completes with either the
    /// cell's own result or the gate's error, whichever lands first.
    pub fn hook(&self, cell: Deferred<T>) -> Deferred<T> {
        let mut inner = self.inner.borrow_mut();
        if let Some(error) = &inner.error {
            return Deferred::failed(&self.disp, error.clone());
        }
        if cell.is_done() {
            return cell;
        }

        inner.hook_count += 1;
        if inner.hook_count >= COMPACTION_SCHEDULE {
            inner.hook_count = 0;
            inner.proxies.retain(|proxy| !proxy.is_done());
        }

        let proxy = Deferred::new(&self.disp);
        let forward = proxy.clone();
        cell.on_complete(Box::new(move |result| {
            match result {
                Ok(value) => forward.try_set_result(value),
                Err(error) => forward.try_set_error(error),
            };
        }));
        inner.proxies.push(proxy.clone());
        proxy
    }

    /// Trips the gate: every hooked proxy still pending fails with `error`.
    pub fn trip(&self, error: Fail) {
        let proxies = {
            let mut inner = self.inner.borrow_mut();
            assert!(inner.error.is_none(), "error gate tripped twice");
            inner.error = Some(error.clone());
            std::mem::take(&mut inner.proxies)
        };
        for proxy in proxies {
            proxy.try_set_error(error.clone());
        }
    }
}

impl<T> Clone for ErrorGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            disp: self.disp.clone(),
        }
    }
}

//==============================================================================
// Round Robin
//==============================================================================

struct RoundRobinInner {
    waiting: VecDeque<Deferred<()>>,
    count: usize,
}

/// A cooperative gate that passes control between a cohort of tasks.
///
/// Each task calls [swap](Self::swap) to park itself; once the waiter list
/// reaches the cohort size, the oldest waiter is released. A task leaving the
/// rotation calls [done](Self::done).
pub struct RoundRobin {
    inner: Rc<RefCell<RoundRobinInner>>,
    disp: Dispatcher,
}

/// Associate functions for [RoundRobin].
impl RoundRobin {
    /// Creates a gate for a cohort of `count` tasks.
    pub fn new(disp: &Dispatcher, count: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RoundRobinInner {
                waiting: VecDeque::new(),
                count,
            })),
            disp: disp.clone(),
        }
    }

    /// Parks the caller and, once the whole cohort is parked, releases the
    /// oldest waiter.
    pub fn swap(&self) -> Deferred<()> {
        let cell = Deferred::new(&self.disp);
        let released = {
            let mut inner = self.inner.borrow_mut();
            inner.waiting.push_back(cell.clone());
            if inner.waiting.len() == inner.count {
                inner.waiting.pop_front()
            } else {
                None
            }
        };
        if let Some(waiter) = released {
            waiter.set_result(());
        }
        cell
    }

    /// Removes the caller from the rotation, releasing the oldest waiter if
    /// the remaining cohort is now fully parked.
    pub fn done(&self) {
        let released = {
            let mut inner = self.inner.borrow_mut();
            inner.count -= 1;
            if inner.count > 0 && inner.waiting.len() == inner.count {
                inner.waiting.pop_front()
            } else {
                None
            }
        };
        if let Some(waiter) = released {
            waiter.set_result(());
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
