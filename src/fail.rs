// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;
use nix::errno::Errno;

//==============================================================================
// Constants & Structures
//==============================================================================

custom_error! {#[derive(Clone, PartialEq)] pub Fail
    Protocol{ details: &'static str } = "protocol error: {details}",
    Encoding{} = "text payload is not valid UTF-8",
    PayloadTooBig{} = "payload exceeds the maximum fragment size",
    InterruptedTransfer{ details: &'static str } = "interrupted transfer: {details}",
    StreamClosed{} = "stream closed",
    TryAgain{} = "operation not ready, try again",
    Os{ errno: i32 } = "operating system error (errno {errno})",
    ConnectionRefused{} = "connection refused",
    ConnectionAborted{} = "connection aborted",
    NotConnected{ details: &'static str } = "{details}: socket was not connected",
    QueueClosed{} = "event queue is closed",
    Invalid{ details: &'static str } = "invalid argument: {details}",
    Malformed{ details: &'static str } = "malformed input: {details}",
    Handshake{ details: &'static str } = "invalid handshake: {details}",
    Unsupported{ details: &'static str } = "unsupported: {details}",
    WebsocketClosed{} = "websocket is closed",
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Fail].
impl Fail {
    /// Converts a syscall failure into a [Fail].
    ///
    /// `EWOULDBLOCK`/`EAGAIN` map onto [Fail::TryAgain] so that callers can
    /// treat would-block conditions as a retry signal rather than an error.
    pub fn from_os(error: nix::Error) -> Fail {
        match error {
            nix::Error::Sys(e) if e == Errno::EAGAIN => {
                Fail::TryAgain {}
            }
            nix::Error::Sys(e) if e == Errno::EPIPE || e == Errno::ECONNRESET => {
                Fail::StreamClosed {}
            }
            nix::Error::Sys(e) => Fail::Os { errno: e as i32 },
            _ => Fail::Os { errno: 0 },
        }
    }

    /// Returns `true` for terminal transport failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Fail::InterruptedTransfer { .. } | Fail::StreamClosed {} | Fail::Os { .. }
        )
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
