// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;

use nix::{
    sys::epoll::{
        epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
    },
    unistd,
};

use std::{os::unix::io::RawFd, time::Duration};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Error and hangup conditions are always of interest, whatever mask a
/// callback registered with.
pub fn error_checking_mask() -> EpollFlags {
    EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP
}

/// Upper bound on readiness events drained per poll.
const MAX_EVENTS: usize = 64;

/// Readiness multiplexer backed by epoll.
///
/// One combined interest mask is kept per file descriptor; the dispatcher is
/// responsible for splitting readiness back out to individual callbacks.
pub struct Poller {
    epfd: RawFd,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Poller].
impl Poller {
    /// Creates a poller.
    pub fn new() -> Result<Self, Fail> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Fail::from_os)?;
        Ok(Self { epfd })
    }

    /// Starts watching `fd` with the given combined interest mask.
    pub fn register(&self, fd: RawFd, mask: EpollFlags) -> Result<(), Fail> {
        let mut event = EpollEvent::new(mask, fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event).map_err(Fail::from_os)
    }

    /// Replaces the combined interest mask for `fd`.
    pub fn modify(&self, fd: RawFd, mask: EpollFlags) -> Result<(), Fail> {
        let mut event = EpollEvent::new(mask, fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event).map_err(Fail::from_os)
    }

    /// Stops watching `fd`.
    pub fn unregister(&self, fd: RawFd) -> Result<(), Fail> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None::<&mut EpollEvent>)
            .map_err(Fail::from_os)
    }

    /// Waits for readiness events, appending `(fd, active mask)` pairs to
    /// `events`. A timeout of `None` blocks indefinitely; a zero timeout polls
    /// without blocking. Sub-millisecond timeouts are rounded up so that a
    /// short timer wait does not degenerate into a busy loop.
    pub fn poll(
        &self,
        timeout: Option<Duration>,
        events: &mut Vec<(RawFd, EpollFlags)>,
    ) -> Result<(), Fail> {
        let timeout_ms: isize = match timeout {
            None => -1,
            Some(d) => {
                let rounded = d
                    .checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis();
                rounded as isize
            }
        };
        let mut buffer = [EpollEvent::empty(); MAX_EVENTS];
        let count = loop {
            match epoll_wait(self.epfd, &mut buffer, timeout_ms) {
                Ok(n) => break n,
                // Poll interrupted by a signal; retry.
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => return Err(Fail::from_os(e)),
            }
        };
        for event in &buffer[..count] {
            events.push((event.data() as RawFd, event.events()));
        }
        Ok(())
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Drop trait implementation for [Poller].
impl Drop for Poller {
    fn drop(&mut self) {
        if let Err(e) = unistd::close(self.epfd) {
            warn!("failed to close epoll instance ({:?})", e);
        }
    }
}
