// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::dispatcher::Dispatcher;

use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// One scheduled callback.
///
/// Entries compare by deadline; ties resolve in push order so that the heap
/// pops equal-deadline entries first-scheduled-first.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: Box<dyn FnOnce()>,
}

/// Min-heap of scheduled callbacks.
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [TimerHeap].
impl TimerHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Schedules `callback` to run at `deadline`.
    pub fn push(&mut self, deadline: Instant, callback: Box<dyn FnOnce()>) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            callback,
        });
    }

    /// Earliest deadline in the heap, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the earliest callback if its deadline has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Box<dyn FnOnce()>> {
        let expired = match self.heap.peek() {
            Some(entry) => entry.deadline <= now,
            None => false,
        };
        if expired {
            Some(self.heap.pop().unwrap().callback)
        } else {
            None
        }
    }

}

//==============================================================================
// Trait Implementations
//==============================================================================

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed ordering turns the standard max-heap into a min-heap on
/// `(deadline, seq)`.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

//==============================================================================
// RecurringEvent
//==============================================================================

struct RecurringInner {
    interval: Duration,
    // Taken out of the slot while running so the callback may call `stop`.
    callback: Option<Box<dyn FnMut()>>,
    running: bool,
    stopping: bool,
}

/// A callback repeating at a fixed interval.
///
/// Once begun, the callback keeps firing every `interval` until
/// [stop](Self::stop) is called. Stopping does not recall the firing already
/// in flight: that callback still runs once more at its scheduled time, and
/// only the re-arming is suppressed.
pub struct RecurringEvent {
    inner: Rc<RefCell<RecurringInner>>,
    disp: Dispatcher,
}

/// Associate functions for [RecurringEvent].
impl RecurringEvent {
    /// Creates a stopped recurring event.
    pub fn new<F: FnMut() + 'static>(disp: &Dispatcher, interval: Duration, callback: F) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RecurringInner {
                interval,
                callback: Some(Box::new(callback)),
                running: false,
                stopping: false,
            })),
            disp: disp.clone(),
        }
    }

    /// Starts the regular callbacks.
    ///
    /// Beginning an event that is in the process of stopping cancels the stop;
    /// the previously scheduled firing runs at the time it was scheduled for.
    /// Beginning an event that is already running is a usage error.
    pub fn begin(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.stopping {
            inner.stopping = false;
        } else if inner.running {
            panic!("recurring event was already running");
        } else {
            inner.running = true;
            drop(inner);
            self.arm();
        }
    }

    /// Stops the regular callbacks. Stopping an event that is not running is a
    /// usage error.
    pub fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.running {
            panic!("recurring event was not running");
        }
        inner.stopping = true;
    }

    fn arm(&self) {
        let interval = self.inner.borrow().interval;
        let inner = self.inner.clone();
        let this = Self {
            inner: self.inner.clone(),
            disp: self.disp.clone(),
        };
        self.disp.schedule_at(Instant::now() + interval, move || {
            let mut callback = inner
                .borrow_mut()
                .callback
                .take()
                .expect("recurring callback re-entered");
            callback();
            let stopping = {
                let mut borrowed = inner.borrow_mut();
                borrowed.callback = Some(callback);
                borrowed.stopping
            };
            if stopping {
                let mut borrowed = inner.borrow_mut();
                borrowed.running = false;
                borrowed.stopping = false;
            } else {
                this.arm();
            }
        });
    }
}
