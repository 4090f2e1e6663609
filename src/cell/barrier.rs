// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::dispatcher::Dispatcher;

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

//==============================================================================
// Constants & Structures
//==============================================================================

struct BarrierInner {
    released: bool,
    waiters: Vec<usize>,
}

/// A parameter-free completion signal with any number of waiters.
///
/// Unlike a [Deferred](crate::cell::Deferred), a barrier carries no value and
/// no error: tasks can only wait until some other party releases it. Releasing
/// twice is a usage error.
#[derive(Clone)]
pub struct Barrier {
    inner: Rc<RefCell<BarrierInner>>,
    disp: Dispatcher,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Barrier].
impl Barrier {
    /// Creates an unreleased barrier.
    pub fn new(disp: &Dispatcher) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BarrierInner {
                released: false,
                waiters: Vec::new(),
            })),
            disp: disp.clone(),
        }
    }

    /// Returns `true` once the barrier has been released.
    pub fn is_released(&self) -> bool {
        self.inner.borrow().released
    }

    /// Releases the barrier, scheduling every waiting task at the head of the
    /// main queue.
    pub fn release(&self) {
        for id in self.mark_released() {
            self.disp.resume_task(id);
        }
    }

    /// Releases the barrier, resuming every waiting task synchronously.
    pub fn release_fast(&self) {
        for id in self.mark_released() {
            self.disp.resume_task_now(id);
        }
    }

    fn mark_released(&self) -> Vec<usize> {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.released, "barrier released twice");
        inner.released = true;
        std::mem::take(&mut inner.waiters)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Awaiting a barrier suspends until release; an already-released barrier
/// returns immediately.
impl Future for Barrier {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _ctx: &mut Context) -> Poll<()> {
        let self_ = self.get_mut();
        let mut inner = self_.inner.borrow_mut();
        if inner.released {
            return Poll::Ready(());
        }
        let current = self_
            .disp
            .current_task()
            .expect("barrier awaited outside a dispatcher task");
        if !inner.waiters.contains(&current) {
            inner.waiters.push(current);
        }
        Poll::Pending
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
