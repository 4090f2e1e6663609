// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Central event management: a priority-tiered callback queue, a timer heap,
//! an epoll-backed readiness poller, and the table of suspended tasks. All
//! execution is single-threaded and cooperative; the dispatcher is an
//! explicit, cloneable context handle rather than a process-wide global.

mod poller;
mod timer;

pub use self::timer::RecurringEvent;

use self::{
    poller::{error_checking_mask, Poller},
    timer::TimerHeap,
};
use crate::{cell::Deferred, fail::Fail};

use futures::task::noop_waker_ref;
use nix::sys::epoll::EpollFlags;
use slab::Slab;

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    future::Future,
    os::unix::io::RawFd,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Callback bound to a file-descriptor readiness mask.
pub type EventHandler = dyn Fn(EpollFlags);

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Synchronous task resumptions nest on the stack; beyond this depth further
/// resumptions degrade to head-of-queue scheduling.
const MAX_FAST_DEPTH: usize = 64;

/// One runnable unit in a dispatcher queue.
enum Handle {
    /// Plain scheduled callback.
    Callback(Box<dyn FnOnce()>),
    /// Readiness notification for a registered file event.
    Event(Rc<EventHandler>, EpollFlags),
    /// Resumption of a suspended task.
    Task(usize),
}

struct DispatcherInner {
    // High-priority handles enter at the head, medium-priority at the tail.
    main_queue: VecDeque<Handle>,
    low_queue: VecDeque<Handle>,
    timers: TimerHeap,
    handles: HashMap<RawFd, Vec<(EpollFlags, Rc<EventHandler>)>>,
    poller: Poller,
    tasks: Slab<Option<TaskFuture>>,
    current: Option<usize>,
    fast_depth: usize,
}

/// Cloneable handle to the event dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<RefCell<DispatcherInner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Dispatcher].
impl Dispatcher {
    /// Creates a dispatcher with a fresh poller.
    pub fn new() -> Result<Self, Fail> {
        let inner = DispatcherInner {
            main_queue: VecDeque::new(),
            low_queue: VecDeque::new(),
            timers: TimerHeap::new(),
            handles: HashMap::new(),
            poller: Poller::new()?,
            tasks: Slab::new(),
            current: None,
            fast_depth: 0,
        };
        Ok(Self {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Inserts a callback at the head of the main queue.
    pub fn schedule_high<F: FnOnce() + 'static>(&self, callback: F) {
        self.inner
            .borrow_mut()
            .main_queue
            .push_front(Handle::Callback(Box::new(callback)));
    }

    /// Appends a callback to the tail of the main queue.
    pub fn schedule_medium<F: FnOnce() + 'static>(&self, callback: F) {
        self.inner
            .borrow_mut()
            .main_queue
            .push_back(Handle::Callback(Box::new(callback)));
    }

    /// Appends a callback to the low-priority queue. Low-priority handles
    /// never starve event polling: one is promoted to the main queue per
    /// scheduling step, after a non-blocking poll.
    pub fn schedule_low<F: FnOnce() + 'static>(&self, callback: F) {
        self.inner
            .borrow_mut()
            .low_queue
            .push_back(Handle::Callback(Box::new(callback)));
    }

    /// Schedules a callback to run once `deadline` has passed.
    pub fn schedule_at<F: FnOnce() + 'static>(&self, deadline: Instant, callback: F) {
        self.inner
            .borrow_mut()
            .timers
            .push(deadline, Box::new(callback));
    }

    /// Completes a cell after `duration` has elapsed.
    pub fn sleep(&self, duration: Duration) -> Deferred<()> {
        let cell = Deferred::new(self);
        let completion = cell.clone();
        self.schedule_at(Instant::now() + duration, move || completion.set_result(()));
        cell
    }

    /// Adds a `(mask, handler)` binding for `fd` and updates the poller's
    /// combined interest mask. Overlapping masks on one descriptor are a
    /// usage error and fail loudly.
    pub fn register_fd(&self, fd: RawFd, mask: EpollFlags, handler: Rc<EventHandler>) {
        trace!("register_fd(): fd={:?} mask={:?}", fd, mask);
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        match inner.handles.get_mut(&fd) {
            Some(bindings) => {
                let mut combined = mask;
                for (registered, _) in bindings.iter() {
                    if !(*registered & mask).is_empty() {
                        panic!(
                            "mask clash on fd {}: {:?} overlaps registered {:?}",
                            fd, mask, registered
                        );
                    }
                    combined |= *registered;
                }
                if let Err(e) = inner.poller.modify(fd, combined) {
                    panic!("failed to update interest for fd {} ({})", fd, e);
                }
                bindings.push((mask, handler));
            }
            None => {
                if let Err(e) = inner.poller.register(fd, mask) {
                    panic!("failed to register fd {} ({})", fd, e);
                }
                inner.handles.insert(fd, vec![(mask, handler)]);
            }
        }
    }

    /// Removes the `(fd, mask)` binding; drops the descriptor from the poller
    /// once no masks remain. Unregistering a binding that does not exist is a
    /// usage error and fails loudly.
    pub fn unregister_fd(&self, fd: RawFd, mask: EpollFlags) {
        trace!("unregister_fd(): fd={:?} mask={:?}", fd, mask);
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let bindings = match inner.handles.get_mut(&fd) {
            Some(bindings) => bindings,
            None => panic!("fd {} mask {:?} was not registered", fd, mask),
        };
        let position = match bindings.iter().position(|(m, _)| *m == mask) {
            Some(position) => position,
            None => panic!("fd {} mask {:?} was not registered", fd, mask),
        };
        bindings.remove(position);
        if bindings.is_empty() {
            inner.handles.remove(&fd);
            // The descriptor may already be gone OS-side (closed peer); epoll
            // cleans up closed descriptors itself.
            if let Err(e) = inner.poller.unregister(fd) {
                warn!("failed to drop fd {} from poller ({})", fd, e);
            }
        } else {
            let mut combined = EpollFlags::empty();
            for (registered, _) in bindings.iter() {
                combined |= *registered;
            }
            if let Err(e) = inner.poller.modify(fd, combined) {
                warn!("failed to narrow interest for fd {} ({})", fd, e);
            }
        }
    }

    /// Re-instantiates the poller (e.g. after a process fork) and re-registers
    /// the combined interest mask of every live descriptor. Queues and timers
    /// are untouched.
    pub fn reset_poller(&self) -> Result<(), Fail> {
        let mut inner = self.inner.borrow_mut();
        let poller = Poller::new()?;
        for (fd, bindings) in inner.handles.iter() {
            let mut combined = EpollFlags::empty();
            for (mask, _) in bindings.iter() {
                combined |= *mask;
            }
            poller.register(*fd, combined)?;
        }
        inner.poller = poller;
        Ok(())
    }

    /// Runs every callback currently in the main queue without polling for
    /// events or advancing timers.
    pub fn flush(&self) {
        loop {
            if self.inner.borrow().main_queue.is_empty() {
                break;
            }
            self.run_next();
        }
    }

    /// Executes one scheduling step: replenish the main queue from expired
    /// timers, the low-priority queue, or a readiness poll, then run the next
    /// handle. Does nothing when a poll produced no work.
    pub fn run_next(&self) {
        let handle = {
            let mut inner = self.inner.borrow_mut();
            if inner.main_queue.is_empty() {
                Self::replenish(&mut inner);
            }
            inner.main_queue.pop_front()
        };
        match handle {
            Some(Handle::Callback(callback)) => callback(),
            Some(Handle::Event(handler, mask)) => handler(mask),
            Some(Handle::Task(id)) => self.poll_task(id),
            None => (),
        }
    }

    /// Launches a future as a parallel task and returns the cell holding its
    /// eventual result.
    pub fn spawn<F, T>(&self, future: F) -> Deferred<T>
    where
        F: Future<Output = Result<T, Fail>> + 'static,
        T: 'static,
    {
        let cell = Deferred::new(self);
        let completion = cell.clone();
        let wrapped = async move {
            match future.await {
                Ok(value) => completion.set_result_fast(value),
                Err(error) => completion.set_error_fast(error),
            }
        };
        let id = self
            .inner
            .borrow_mut()
            .tasks
            .insert(Some(Box::pin(wrapped)));
        trace!("spawn(): task={:?}", id);
        self.inner.borrow_mut().main_queue.push_front(Handle::Task(id));
        cell
    }

    /// Drives the event loop until `cell` completes, then returns its result.
    ///
    /// This is the single blocking entry point into the runtime. Calling it
    /// from inside a task is a usage error: tasks suspend with `.await`.
    pub fn wait<T: 'static>(&self, cell: Deferred<T>) -> Result<T, Fail> {
        if self.inner.borrow().current.is_some() {
            panic!("wait() called from inside a task; use .await instead");
        }
        loop {
            if cell.is_done() {
                return cell.take_result();
            }
            self.run_next();
        }
    }

    /// Spawns `future` and blocks until it completes.
    pub fn run<F, T>(&self, future: F) -> Result<T, Fail>
    where
        F: Future<Output = Result<T, Fail>> + 'static,
        T: 'static,
    {
        let cell = self.spawn(future);
        self.wait(cell)
    }

    /// Identifier of the task currently being polled, if any.
    pub(crate) fn current_task(&self) -> Option<usize> {
        self.inner.borrow().current
    }

    /// Schedules a task resumption at the head of the main queue.
    pub(crate) fn resume_task(&self, id: usize) {
        self.inner
            .borrow_mut()
            .main_queue
            .push_front(Handle::Task(id));
    }

    /// Schedules a task resumption at the tail of the main queue.
    pub(crate) fn resume_task_late(&self, id: usize) {
        self.inner
            .borrow_mut()
            .main_queue
            .push_back(Handle::Task(id));
    }

    /// Parks a task resumption on the low-priority queue.
    pub(crate) fn park_task_low(&self, id: usize) {
        self.inner.borrow_mut().low_queue.push_back(Handle::Task(id));
    }

    /// Resumes a task synchronously on the current stack. Beyond
    /// [MAX_FAST_DEPTH] nested resumptions the call degrades to
    /// head-of-queue scheduling so long completion chains cannot overflow
    /// the stack.
    pub(crate) fn resume_task_now(&self, id: usize) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.fast_depth >= MAX_FAST_DEPTH {
                inner.main_queue.push_front(Handle::Task(id));
                return;
            }
            inner.fast_depth += 1;
        }
        self.poll_task(id);
        self.inner.borrow_mut().fast_depth -= 1;
    }

    /// Polls the task `id` once, retiring it on completion. Stale resumptions
    /// of an already-retired task are ignored.
    fn poll_task(&self, id: usize) {
        let mut future = {
            let mut inner = self.inner.borrow_mut();
            match inner.tasks.get_mut(id).and_then(|slot| slot.take()) {
                Some(future) => future,
                None => return,
            }
        };
        let previous = {
            let mut inner = self.inner.borrow_mut();
            std::mem::replace(&mut inner.current, Some(id))
        };
        let mut ctx = Context::from_waker(noop_waker_ref());
        let poll = future.as_mut().poll(&mut ctx);
        let mut inner = self.inner.borrow_mut();
        inner.current = previous;
        match poll {
            Poll::Ready(()) => {
                inner.tasks.remove(id);
            }
            Poll::Pending => {
                if let Some(slot) = inner.tasks.get_mut(id) {
                    *slot = Some(future);
                }
            }
        }
    }

    /// Moves work into an empty main queue: expired timers first; otherwise a
    /// non-blocking poll plus one low-priority promotion; otherwise a blocking
    /// poll bounded by the next timer deadline.
    fn replenish(inner: &mut DispatcherInner) {
        let now = Instant::now();
        match inner.timers.next_deadline() {
            Some(deadline) if deadline <= now => {
                Self::drain_expired_timers(inner);
            }
            next => {
                if !inner.low_queue.is_empty() {
                    Self::poll_events(inner, Some(Duration::from_millis(0)));
                    if let Some(handle) = inner.low_queue.pop_front() {
                        inner.main_queue.push_back(handle);
                    }
                } else {
                    let timeout = next.map(|deadline| deadline - now);
                    Self::poll_events(inner, timeout);
                    if inner.main_queue.is_empty() {
                        Self::drain_expired_timers(inner);
                    }
                }
            }
        }
    }

    /// Moves every expired timer callback onto the tail of the main queue.
    fn drain_expired_timers(inner: &mut DispatcherInner) {
        loop {
            match inner.timers.pop_expired(Instant::now()) {
                Some(callback) => inner.main_queue.push_back(Handle::Callback(callback)),
                None => break,
            }
        }
    }

    /// Polls the multiplexer and translates readiness into main-queue
    /// entries: each registered mask on an active descriptor whose effective
    /// mask `(m | ERR | HUP) & active` is non-zero gets one notification.
    fn poll_events(inner: &mut DispatcherInner, timeout: Option<Duration>) {
        let mut events = Vec::new();
        if let Err(e) = inner.poller.poll(timeout, &mut events) {
            warn!("poll failed ({})", e);
            return;
        }
        for (fd, active) in events {
            if let Some(bindings) = inner.handles.get(&fd) {
                for (mask, handler) in bindings.iter() {
                    let effective = (*mask | error_checking_mask()) & active;
                    if !effective.is_empty() {
                        inner
                            .main_queue
                            .push_back(Handle::Event(handler.clone(), effective));
                    }
                }
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Tearing the dispatcher down with file events still registered is a bug in
/// the application: every successful registration must be balanced by an
/// unregistration first.
impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let fds: Vec<RawFd> = self.handles.keys().copied().collect();
            if std::thread::panicking() {
                error!("dispatcher dropped with events still registered: {:?}", fds);
            } else {
                panic!("dispatcher dropped with events still registered: {:?}", fds);
            }
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
