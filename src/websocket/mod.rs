// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The WebSocket protocol engine: a fragmented-frame state machine with
//! control-frame interleaving and a bilateral close handshake, layered on a
//! [StreamSocket]. The opening handshake is performed separately (see
//! [handshake]) before a socket is wrapped.

pub mod framing;
pub mod handshake;

use self::framing::{parse_close_data, read_fragment, write_fragment, Opcode};
use crate::{
    cell::Deferred,
    collections::bytes::Bytes,
    dispatcher::Dispatcher,
    fail::Fail,
    queue::ResultQueue,
    socket::StreamSocket,
};

use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Largest fragment accepted or produced before splitting.
const DEFAULT_MAX_SIZE: usize = 4096;

/// Incoming-message queue depth used by [serve].
const DEFAULT_QUEUE_LENGTH: isize = 10;

/// One complete application message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Which side caused the connection to close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseInitiator {
    ByError,
    ByLocal,
    ByRemote,
    ByLocalTimeout,
}

/// Status code and UTF-8 reason carried by a close frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// The final account of a closed connection: who initiated it, the reason the
/// initiating close frame carried, and the reason of the acknowledging frame
/// (if one arrived).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClosingData {
    pub initiator: CloseInitiator,
    pub response: Option<CloseReason>,
    pub reason: Option<CloseReason>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EngineState {
    Open,
    Closing,
    Closed,
    Error,
}

/// Partial-message accumulator kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Build {
    Nothing,
    Text,
    Binary,
}

/// Classification of one received frame.
enum Recv {
    Ping,
    Pong,
    Close,
    SingleText(Bytes),
    SingleBinary(Bytes),
    StartText(Bytes),
    StartBinary(Bytes),
    Continue(Bytes),
    FinalFragment(Bytes),
}

struct WebsocketInner {
    socket: StreamSocket,
    state: EngineState,
    closing_data: ClosingData,
    // Outstanding pings in send order; a pong clears every entry at or
    // before its matching payload.
    pings: VecDeque<(Bytes, Deferred<()>)>,
    receive_mask: bool,
    send_mask: bool,
    max_size: usize,
    // Tail of the send chain; each send awaits its predecessor.
    cur_wait: Deferred<()>,
}

/// A WebSocket connection.
///
/// `receive_mask` and `send_mask` pick the side of the connection: a server
/// expects masked input and sends unmasked output, a client the reverse.
pub struct Websocket {
    inner: Rc<RefCell<WebsocketInner>>,
    data_queue: ResultQueue<Message>,
    main_loop: Rc<RefCell<Option<Deferred<()>>>>,
    disp: Dispatcher,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Websocket].
impl Websocket {
    /// Wraps a connected socket whose opening handshake has already cleared
    /// and starts the receive loop.
    pub fn new(
        disp: &Dispatcher,
        socket: StreamSocket,
        receive_mask: bool,
        send_mask: bool,
        queue_length: isize,
    ) -> Self {
        let websocket = Self {
            inner: Rc::new(RefCell::new(WebsocketInner {
                socket,
                state: EngineState::Open,
                closing_data: ClosingData {
                    initiator: CloseInitiator::ByError,
                    response: None,
                    reason: None,
                },
                pings: VecDeque::new(),
                receive_mask,
                send_mask,
                max_size: DEFAULT_MAX_SIZE,
                cur_wait: Deferred::completed(disp, ()),
            })),
            data_queue: ResultQueue::new(disp, queue_length),
            main_loop: Rc::new(RefCell::new(None)),
            disp: disp.clone(),
        };
        let engine = websocket.clone();
        let cell = disp.spawn(async move { engine.main_loop_task().await });
        *websocket.main_loop.borrow_mut() = Some(cell);
        websocket
    }

    /// Adjusts the fragment-size cap (and the outgoing split threshold).
    pub fn set_max_size(&self, max_size: usize) {
        self.inner.borrow_mut().max_size = max_size;
    }

    /// Receives one complete message. Blocks (asynchronously) until a
    /// message is available; fails once the connection is closing or closed.
    pub fn recv(&self) -> Deferred<Message> {
        trace!("recv()");
        if self.inner.borrow().state == EngineState::Open {
            self.data_queue.get()
        } else {
            Deferred::failed(&self.disp, Fail::WebsocketClosed {})
        }
    }

    /// Sends one complete message, splitting it into fragments when it
    /// exceeds the size cap. Concurrent sends are serialized in call order.
    pub async fn send(&self, message: Message) -> Result<(), Fail> {
        trace!("send()");
        if self.inner.borrow().state != EngineState::Open {
            return Err(Fail::WebsocketClosed {});
        }
        let my_turn = Deferred::new(&self.disp);
        let prior = {
            let mut inner = self.inner.borrow_mut();
            std::mem::replace(&mut inner.cur_wait, my_turn.clone())
        };
        prior.await?;
        let result = self.write_data_frame(message).await;
        // Release the chain on failure too: one failed send must not wedge
        // every later one.
        my_turn.set_result(());
        result
    }

    /// Sends a ping and waits for the matching pong.
    pub async fn ping(&self, payload: Bytes) -> Result<(), Fail> {
        trace!("ping()");
        if self.inner.borrow().state != EngineState::Open {
            return Err(Fail::WebsocketClosed {});
        }
        let cell = Deferred::new(&self.disp);
        let (socket, send_mask) = {
            let mut inner = self.inner.borrow_mut();
            inner.pings.push_back((payload.clone(), cell.clone()));
            (inner.socket.clone(), inner.send_mask)
        };
        write_fragment(&socket, send_mask, Opcode::Ping, &payload[..], true).await?;
        cell.await
    }

    /// Closes the connection: sends a close frame (when still open), arms a
    /// timeout that force-closes if the peer never answers, waits for the
    /// receive loop to wind down, and reports how the connection ended.
    pub async fn close(
        &self,
        timeout: Duration,
        reason: CloseReason,
    ) -> Result<ClosingData, Fail> {
        trace!("close(): reason={:?}", reason);
        if self.inner.borrow().state == EngineState::Open {
            self.inner.borrow_mut().state = EngineState::Closing;
            self.send_close(timeout, reason, CloseInitiator::ByLocal).await?;
        }
        let main_loop = self.main_loop.borrow_mut().take();
        if let Some(cell) = main_loop {
            cell.await?;
        }
        Ok(self.inner.borrow().closing_data.clone())
    }

    /// The closing account recorded so far.
    pub fn closing_data(&self) -> ClosingData {
        self.inner.borrow().closing_data.clone()
    }

    /// The receive loop. Runs as a background task from construction until
    /// the connection closes, assembling fragments, answering pings, and
    /// driving the close handshake.
    async fn main_loop_task(&self) -> Result<(), Fail> {
        let mut build_bits: Vec<Bytes> = Vec::new();
        let mut build_what = Build::Nothing;
        loop {
            if self.inner.borrow().state == EngineState::Closed {
                break;
            }
            let building = build_what != Build::Nothing;
            match self.read_next_frame(building).await {
                Ok(Recv::Ping) | Ok(Recv::Pong) | Ok(Recv::Close) => (),
                Ok(Recv::SingleText(data)) => match String::from_utf8(data[..].to_vec()) {
                    Ok(text) => {
                        self.data_queue.put_result(Message::Text(text)).await?;
                    }
                    Err(..) => self.fail_connection(1007).await?,
                },
                Ok(Recv::SingleBinary(data)) => {
                    self.data_queue.put_result(Message::Binary(data)).await?;
                }
                Ok(Recv::StartText(data)) => {
                    build_what = Build::Text;
                    build_bits.push(data);
                }
                Ok(Recv::StartBinary(data)) => {
                    build_what = Build::Binary;
                    build_bits.push(data);
                }
                Ok(Recv::Continue(data)) => build_bits.push(data),
                Ok(Recv::FinalFragment(data)) => {
                    build_bits.push(data);
                    let whole = Bytes::concat(build_bits.iter());
                    build_bits.clear();
                    let message = match build_what {
                        Build::Binary => Some(Message::Binary(whole)),
                        Build::Text => match String::from_utf8(whole[..].to_vec()) {
                            Ok(text) => Some(Message::Text(text)),
                            Err(..) => {
                                self.fail_connection(1007).await?;
                                None
                            }
                        },
                        Build::Nothing => None,
                    };
                    build_what = Build::Nothing;
                    if let Some(message) = message {
                        self.data_queue.put_result(message).await?;
                    }
                }
                Err(error) if error.is_transport() => {
                    debug!("transport failed, tearing down ({})", error);
                    let socket = self.inner.borrow().socket.clone();
                    socket.force_close(Fail::InterruptedTransfer {
                        details: "websocket transport failed",
                    });
                    break;
                }
                Err(Fail::Protocol { .. }) => self.fail_connection(1002).await?,
                Err(Fail::Encoding {}) => self.fail_connection(1007).await?,
                Err(Fail::PayloadTooBig {}) => self.fail_connection(1009).await?,
                Err(..) => self.fail_connection(1011).await?,
            }
        }

        if self.inner.borrow().state != EngineState::Closed {
            self.inner.borrow_mut().state = EngineState::Closed;
            let socket = self.inner.borrow().socket.clone();
            socket.close().await?;
        }

        // Consumers already parked on the queue learn that no more messages
        // are coming.
        while self.data_queue.virtual_size() < 0 {
            let accepted = self.data_queue.put_error(Fail::WebsocketClosed {});
            let _ = accepted.take_result();
        }
        Ok(())
    }

    /// Reads and classifies one frame, handling control frames in place.
    async fn read_next_frame(&self, building: bool) -> Result<Recv, Fail> {
        let (socket, receive_mask, max_size) = {
            let inner = self.inner.borrow();
            (inner.socket.clone(), inner.receive_mask, inner.max_size)
        };
        let (opcode, data, final_fragment) = read_fragment(&socket, receive_mask, max_size).await?;

        match opcode {
            // Answer pings with corresponding pongs.
            Opcode::Ping => {
                self.write_pong(data).await?;
                Ok(Recv::Ping)
            }
            // A pong acknowledges every ping sent up to the one it matches.
            Opcode::Pong => {
                let resolved: Vec<Deferred<()>> = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.pings.iter().position(|(payload, _)| *payload == data) {
                        Some(index) => inner
                            .pings
                            .drain(..=index)
                            .map(|(_, cell)| cell)
                            .collect(),
                        None => Vec::new(),
                    }
                };
                for cell in resolved {
                    cell.set_result(());
                }
                Ok(Recv::Pong)
            }
            Opcode::Close => {
                let close_reason = parse_close_data(&data)?;
                let state = self.inner.borrow().state;
                if state == EngineState::Open {
                    // The remote end initiated the close; answer in kind
                    // before leaving the loop.
                    let send_mask = self.inner.borrow().send_mask;
                    write_fragment(&socket, send_mask, Opcode::Close, &data[..], true).await?;
                    self.inner.borrow_mut().closing_data = ClosingData {
                        initiator: CloseInitiator::ByRemote,
                        response: None,
                        reason: Some(close_reason),
                    };
                } else {
                    self.inner.borrow_mut().closing_data.response = Some(close_reason);
                }
                self.inner.borrow_mut().state = EngineState::Closed;
                socket.close().await?;
                Ok(Recv::Close)
            }
            Opcode::Text if !building => Ok(if final_fragment {
                Recv::SingleText(data)
            } else {
                Recv::StartText(data)
            }),
            Opcode::Binary if !building => Ok(if final_fragment {
                Recv::SingleBinary(data)
            } else {
                Recv::StartBinary(data)
            }),
            Opcode::Continuation if building => Ok(if final_fragment {
                Recv::FinalFragment(data)
            } else {
                Recv::Continue(data)
            }),
            _ => Err(Fail::Protocol {
                details: "unexpected opcode",
            }),
        }
    }

    async fn write_pong(&self, data: Bytes) -> Result<(), Fail> {
        let (socket, send_mask) = {
            let inner = self.inner.borrow();
            (inner.socket.clone(), inner.send_mask)
        };
        write_fragment(&socket, send_mask, Opcode::Pong, &data[..], true).await?;
        Ok(())
    }

    /// Writes one message, splitting payloads over the size cap into an
    /// initial fragment, continuations, and a final continuation.
    async fn write_data_frame(&self, message: Message) -> Result<(), Fail> {
        let (opcode, data) = match message {
            Message::Text(text) => (Opcode::Text, Bytes::from_vec(text.into_bytes())),
            Message::Binary(data) => (Opcode::Binary, data),
        };
        let (socket, send_mask, max_size) = {
            let inner = self.inner.borrow();
            (inner.socket.clone(), inner.send_mask, inner.max_size)
        };

        if data.len() > max_size {
            write_fragment(&socket, send_mask, opcode, &data[..max_size], false).await?;
            let mut end = max_size;
            while data.len() > end + max_size {
                let start = end;
                end += max_size;
                write_fragment(
                    &socket,
                    send_mask,
                    Opcode::Continuation,
                    &data[start..end],
                    false,
                )
                .await?;
            }
            write_fragment(&socket, send_mask, Opcode::Continuation, &data[end..], true).await?;
        } else {
            write_fragment(&socket, send_mask, opcode, &data[..], true).await?;
        }
        Ok(())
    }

    /// Protocol-level failure: close the connection with `code` and record
    /// an error-initiated closure.
    async fn fail_connection(&self, code: u16) -> Result<(), Fail> {
        warn!("failing connection with close code {}", code);
        if self.inner.borrow().state == EngineState::Open {
            self.inner.borrow_mut().state = EngineState::Error;
            self.send_close(
                Duration::from_millis(500),
                CloseReason {
                    code,
                    reason: String::new(),
                },
                CloseInitiator::ByError,
            )
            .await?;
        }
        Ok(())
    }

    /// Sends a close frame and arms the force-close timeout.
    async fn send_close(
        &self,
        timeout: Duration,
        reason: CloseReason,
        initiator: CloseInitiator,
    ) -> Result<(), Fail> {
        let (socket, send_mask) = {
            let mut inner = self.inner.borrow_mut();
            inner.closing_data = ClosingData {
                initiator,
                response: None,
                reason: Some(reason.clone()),
            };
            (inner.socket.clone(), inner.send_mask)
        };

        let mut payload = Vec::with_capacity(2 + reason.reason.len());
        payload.push((reason.code >> 8) as u8);
        payload.push(reason.code as u8);
        payload.extend_from_slice(reason.reason.as_bytes());

        match write_fragment(&socket, send_mask, Opcode::Close, &payload, true).await {
            Ok(..) => {
                let engine = self.clone();
                self.disp
                    .schedule_at(Instant::now() + timeout, move || engine.close_timeout());
                Ok(())
            }
            Err(error) if error.is_transport() => {
                self.inner.borrow_mut().state = EngineState::Error;
                self.close_timeout();
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Fires when the peer never acknowledged our close frame: tear the
    /// transport down and discard whatever is left in the incoming queue.
    fn close_timeout(&self) {
        if self.inner.borrow().state == EngineState::Closed {
            return;
        }
        let socket = {
            let mut inner = self.inner.borrow_mut();
            let reason = inner.closing_data.reason.clone();
            inner.closing_data = ClosingData {
                initiator: CloseInitiator::ByLocalTimeout,
                response: None,
                reason,
            };
            inner.state = EngineState::Closed;
            inner.socket.clone()
        };
        socket.force_close(Fail::InterruptedTransfer {
            details: "close handshake timed out",
        });
        while self.data_queue.virtual_size() > 0 {
            let cell = self.data_queue.get();
            if cell.is_done() {
                let _ = cell.take_result();
            }
        }
    }
}

impl Clone for Websocket {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            data_queue: self.data_queue.clone(),
            main_loop: self.main_loop.clone(),
            disp: self.disp.clone(),
        }
    }
}

//==============================================================================
// Server Loop
//==============================================================================

/// Accepts connections on `listener`, performs the server handshake, and
/// spawns `handler(websocket, path)` for each established connection. Returns
/// once the listener stops accepting (e.g. it was closed).
pub async fn serve<F, Fut>(disp: &Dispatcher, listener: StreamSocket, handler: F) -> Result<(), Fail>
where
    F: Fn(Websocket, String) -> Fut + 'static,
    Fut: Future<Output = Result<(), Fail>> + 'static,
{
    loop {
        let socket = match listener.accept().await {
            Ok(socket) => socket,
            Err(error) => {
                debug!("accept loop ended ({})", error);
                return Ok(());
            }
        };
        match handshake::server_handshake(&socket, None, None).await {
            Ok((path, _subprotocol)) => {
                let websocket = Websocket::new(disp, socket, true, false, DEFAULT_QUEUE_LENGTH);
                let connection = handler(websocket, path);
                let _ = disp.spawn(async move {
                    if let Err(error) = connection.await {
                        warn!("connection handler failed ({})", error);
                    }
                    Ok(())
                });
            }
            Err(error) => {
                warn!("handshake failed ({})", error);
                socket.force_close(error);
            }
        }
    }
}
