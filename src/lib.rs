// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A single-threaded cooperative asynchronous runtime.
//!
//! The [dispatcher](crate::dispatcher::Dispatcher) multiplexes three sources
//! of work — priority-tiered callback queues, a timer heap, and epoll
//! readiness — under one event loop. Suspended tasks communicate through
//! [deferred cells](crate::cell::Deferred) and [barriers](crate::cell::barrier::Barrier);
//! [buffered stream wrappers](crate::streams) reconcile fixed-size OS reads
//! with variable-size application reads; a [stream socket](crate::socket::StreamSocket)
//! and a [WebSocket engine](crate::websocket::Websocket) sit on top.
//!
//! Everything runs on the calling thread: callbacks run to completion, only
//! explicit awaits suspend, and there are no locks anywhere.

#[macro_use]
extern crate log;

pub mod cell;
pub mod collections;
pub mod dispatcher;
pub mod event;
pub mod fail;
pub mod queue;
pub mod socket;
pub mod streams;
pub mod websocket;

pub use crate::{
    cell::{barrier::Barrier, yield_low, Deferred},
    collections::bytes::Bytes,
    dispatcher::Dispatcher,
    fail::Fail,
    queue::{AsyncQueue, ResultQueue},
    socket::StreamSocket,
    websocket::{Message, Websocket},
};
