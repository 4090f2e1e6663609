// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{cell::Deferred, dispatcher::Dispatcher, fail::Fail};

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

struct QueueInner<T> {
    values: VecDeque<T>,
    get_waiters: VecDeque<Deferred<T>>,
    put_waiters: VecDeque<(Deferred<()>, T)>,
    capacity: isize,
}

/// An asynchronous bounded queue.
///
/// A `put` hands its value straight to a waiting consumer if there is one,
/// buffers it while the queue has space, and otherwise parks the producer
/// until a `get` opens a slot. A `get` drains the buffer, releases a parked
/// producer, or parks the consumer, in that order. A negative capacity
/// disables buffering entirely: every exchange is a rendezvous between one
/// producer and one consumer.
pub struct AsyncQueue<T> {
    inner: Rc<RefCell<QueueInner<T>>>,
    disp: Dispatcher,
}

/// A queue of results: each slot carries either a value or an error, and a
/// `get` resolves accordingly.
pub struct ResultQueue<T> {
    queue: AsyncQueue<Result<T, Fail>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [AsyncQueue].
impl<T: 'static> AsyncQueue<T> {
    /// Creates a queue buffering at most `capacity` values; a negative
    /// capacity means no buffering at all.
    pub fn new(disp: &Dispatcher, capacity: isize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                values: VecDeque::new(),
                get_waiters: VecDeque::new(),
                put_waiters: VecDeque::new(),
                capacity,
            })),
            disp: disp.clone(),
        }
    }

    /// The virtual length of the queue: buffered values plus parked producers
    /// minus parked consumers. Negative when consumers outnumber supply.
    pub fn virtual_size(&self) -> isize {
        let inner = self.inner.borrow();
        inner.values.len() as isize + inner.put_waiters.len() as isize
            - inner.get_waiters.len() as isize
    }

    /// Adds an item, returning a cell that completes once the item has been
    /// accepted (immediately unless the queue is full).
    pub fn put(&self, value: T) -> Deferred<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(consumer) = inner.get_waiters.pop_front() {
            drop(inner);
            consumer.set_result(value);
            Deferred::completed(&self.disp, ())
        } else if (inner.values.len() as isize) < inner.capacity {
            inner.values.push_back(value);
            Deferred::completed(&self.disp, ())
        } else {
            let cell = Deferred::new(&self.disp);
            inner.put_waiters.push_back((cell.clone(), value));
            cell
        }
    }

    /// Retrieves an item, returning a cell that completes once one is
    /// available (immediately unless the queue is empty).
    pub fn get(&self) -> Deferred<T> {
        let mut inner = self.inner.borrow_mut();
        if let Some((producer, value)) = inner.put_waiters.pop_front() {
            let item = if inner.capacity > 0 {
                // The parked producer's value goes to the back of the buffer;
                // the consumer takes the oldest buffered value.
                let item = inner.values.pop_front().expect("full queue had no values");
                inner.values.push_back(value);
                item
            } else {
                value
            };
            drop(inner);
            producer.set_result(());
            Deferred::completed(&self.disp, item)
        } else if let Some(item) = inner.values.pop_front() {
            Deferred::completed(&self.disp, item)
        } else {
            let cell = Deferred::new(&self.disp);
            inner.get_waiters.push_back(cell.clone());
            cell
        }
    }
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            disp: self.disp.clone(),
        }
    }
}

/// Associate functions for [ResultQueue].
impl<T: 'static> ResultQueue<T> {
    /// Creates a result queue; see [AsyncQueue::new].
    pub fn new(disp: &Dispatcher, capacity: isize) -> Self {
        Self {
            queue: AsyncQueue::new(disp, capacity),
        }
    }

    /// See [AsyncQueue::virtual_size].
    pub fn virtual_size(&self) -> isize {
        self.queue.virtual_size()
    }

    /// Adds a value to the queue.
    pub fn put_result(&self, value: T) -> Deferred<()> {
        self.queue.put(Ok(value))
    }

    /// Adds an error to the queue; the `get` that receives it fails.
    pub fn put_error(&self, error: Fail) -> Deferred<()> {
        self.queue.put(Err(error))
    }

    /// Retrieves the next slot, resolving to its value or failing with its
    /// error.
    pub fn get(&self) -> Deferred<T> {
        let slot = self.queue.get();
        if slot.is_done() {
            return match slot.take_result() {
                Ok(Ok(value)) => Deferred::completed(&self.queue.disp, value),
                Ok(Err(error)) | Err(error) => Deferred::failed(&self.queue.disp, error),
            };
        }
        let cell = Deferred::new(&self.queue.disp);
        let completion = cell.clone();
        slot.on_complete(Box::new(move |result| {
            match result {
                Ok(Ok(value)) => completion.set_result_fast(value),
                Ok(Err(error)) | Err(error) => completion.set_error_fast(error),
            };
        }));
        cell
    }
}

impl<T> Clone for ResultQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Three producers against a capacity-2 queue: values arrive in put
    /// order, and the third put is only accepted once the first get opens a
    /// slot.
    #[test]
    fn bounded_queue_backpressure() {
        let disp = Dispatcher::new().unwrap();
        let queue: AsyncQueue<u32> = AsyncQueue::new(&disp, 2);

        let put1 = queue.put(1);
        let put2 = queue.put(2);
        let put3 = queue.put(3);
        assert!(put1.is_done());
        assert!(put2.is_done());
        assert!(!put3.is_done());
        assert_eq!(queue.virtual_size(), 3);

        let consumer = queue.clone();
        let third = put3.clone();
        let drained = disp
            .run(async move {
                let first = consumer.get().await?;
                assert!(third.is_done());
                let second = consumer.get().await?;
                let last = consumer.get().await?;
                Ok(vec![first, second, last])
            })
            .unwrap();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(queue.virtual_size(), 0);

        put1.take_result().unwrap();
        put2.take_result().unwrap();
        put3.take_result().unwrap();
    }

    /// A get on an empty queue parks until the next put.
    #[test]
    fn get_parks_until_put() {
        let disp = Dispatcher::new().unwrap();
        let queue: AsyncQueue<u32> = AsyncQueue::new(&disp, 1);
        assert_eq!(queue.virtual_size(), 0);

        let producer = queue.clone();
        disp.schedule_medium(move || {
            producer.put(5).take_result().unwrap();
        });
        let consumer = queue.clone();
        let value = disp.run(async move { consumer.get().await }).unwrap();
        assert_eq!(value, 5);
    }

    /// A rendezvous queue (negative capacity) never buffers.
    #[test]
    fn rendezvous_queue() {
        let disp = Dispatcher::new().unwrap();
        let queue: AsyncQueue<u32> = AsyncQueue::new(&disp, -1);

        let put = queue.put(7);
        assert!(!put.is_done());
        assert_eq!(queue.virtual_size(), 1);

        let got = queue.get();
        assert!(put.is_done());
        assert_eq!(got.take_result().unwrap(), 7);
        put.take_result().unwrap();
    }

    /// Errors pushed into a result queue surface on the matching get.
    #[test]
    fn result_queue_delivers_errors() {
        let disp = Dispatcher::new().unwrap();
        let queue: ResultQueue<u32> = ResultQueue::new(&disp, 4);

        queue.put_result(1).take_result().unwrap();
        queue.put_error(Fail::StreamClosed {}).take_result().unwrap();

        assert_eq!(queue.get().take_result().unwrap(), 1);
        assert_eq!(queue.get().take_result(), Err(Fail::StreamClosed {}));
    }

    /// An error handed to a parked consumer fails that consumer's cell.
    #[test]
    fn result_queue_parked_consumer_gets_error() {
        let disp = Dispatcher::new().unwrap();
        let queue: ResultQueue<u32> = ResultQueue::new(&disp, 1);

        let producer = queue.clone();
        disp.schedule_medium(move || {
            producer
                .put_error(Fail::WebsocketClosed {})
                .take_result()
                .unwrap();
        });
        let consumer = queue.clone();
        let result = disp.run(async move { consumer.get().await });
        assert_eq!(result, Err(Fail::WebsocketClosed {}));
    }
}
