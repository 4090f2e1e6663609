// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Buffered, backpressure-aware adapters between non-blocking file
//! descriptors and application reads and writes.

mod read;
mod write;

pub use self::{read::ReadWrapper, write::WriteWrapper};

use crate::{collections::bytes::Bytes, fail::Fail};

use nix::{
    fcntl,
    fcntl::{FcntlArg, OFlag},
    unistd,
};

use std::os::unix::io::RawFd;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Default read-buffer watermarks: OS reads resume below the low watermark
/// and pause at or above the high watermark.
pub const LOW_WATERMARK: usize = 128;
pub const HIGH_WATERMARK: usize = 256;

/// Thin byte-stream interface over a raw descriptor.
///
/// Both wrappers drive the same descriptor (one for reads, one for writes);
/// neither owns it. Whoever created the descriptor closes it, after releasing
/// the wrappers.
#[derive(Clone, Copy)]
pub struct StreamFd {
    fd: RawFd,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Puts a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<(), Fail> {
    let flags = fcntl::fcntl(fd, FcntlArg::F_GETFL).map_err(Fail::from_os)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(Fail::from_os)?;
    Ok(())
}

/// Associate functions for [StreamFd].
impl StreamFd {
    /// Wraps a raw descriptor.
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The underlying descriptor number.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Reads up to `limit` bytes. A zero-length read means the peer closed
    /// the stream.
    pub fn read(&self, limit: usize) -> Result<Bytes, Fail> {
        let mut chunk = vec![0u8; limit];
        match unistd::read(self.fd, &mut chunk) {
            Ok(0) => Err(Fail::StreamClosed {}),
            Ok(nbytes) => {
                chunk.truncate(nbytes);
                Ok(Bytes::from_vec(chunk))
            }
            Err(e) => Err(Fail::from_os(e)),
        }
    }

    /// Writes as much of `buf` as the descriptor accepts, returning the
    /// number of bytes taken.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Fail> {
        unistd::write(self.fd, buf).map_err(Fail::from_os)
    }

    /// Flushes buffering below the wrapper. Raw descriptors have none, so
    /// this is a no-op kept for the drain protocol's flush point.
    pub fn flush(&self) -> Result<(), Fail> {
        Ok(())
    }
}
