//! I/O readiness multiplexer facade (§4.3).
//!
//! `Backend` is deliberately readiness-shaped (`add`/`modify`/`remove`/
//! `wait`/`wake`) rather than completion-shaped, per SPEC_FULL's resolved
//! open question #3: only a readiness backend (`mio`, i.e. epoll/kqueue
//! under the hood) ships, but the trait's signatures don't assume readiness
//! semantics, so a completion-style (IOCP/io_uring) backend could implement
//! it later by submitting on the write/accept path and emitting a synthetic
//! readiness event when the operation completes.

use crate::error::{Error, Result};
use mio::{Events, Interest, Poll, Token, Waker};
use std::time::Duration;

/// Readiness bits a registration is interested in, or that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessMask {
    pub readable: bool,
    pub writable: bool,
}

impl ReadinessMask {
    pub const READABLE: Self = Self { readable: true, writable: false };
    pub const WRITABLE: Self = Self { readable: false, writable: true };
    pub const BOTH: Self = Self { readable: true, writable: true };

    pub fn union(self, other: Self) -> Self {
        Self { readable: self.readable || other.readable, writable: self.writable || other.writable }
    }

    fn to_interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// One readiness event delivered by `wait`.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Token reserved for the backend's own wake channel; handle tokens start
/// at 1 and are assigned by the loop.
pub const WAKE_TOKEN: usize = 0;

/// Backend abstraction the loop drives each turn. All methods are
/// loop-thread-only except `wake`, which is explicitly safe to call from
/// any thread (§5 "only `queue_work` and `wake` are safe from non-loop
/// threads").
pub trait Backend {
    fn add(&mut self, fd: &mut dyn mio::event::Source, token: usize, mask: ReadinessMask) -> Result<()>;
    fn modify(&mut self, fd: &mut dyn mio::event::Source, token: usize, mask: ReadinessMask) -> Result<()>;
    fn remove(&mut self, fd: &mut dyn mio::event::Source) -> Result<()>;
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>>;
    fn wake(&self) -> Result<()>;
}

/// The shipped readiness backend: `mio::Poll`, which maps to epoll on
/// Linux and kqueue on BSD/macOS.
pub struct MioBackend {
    poll: Poll,
    events: Events,
    waker: Waker,
}

impl MioBackend {
    pub fn new(max_events: usize) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::reactor(format!("failed to create poller: {e}")))?;
        let waker = Waker::new(poll.registry(), Token(WAKE_TOKEN))
            .map_err(|e| Error::reactor(format!("failed to create wake channel: {e}")))?;
        Ok(Self { poll, events: Events::with_capacity(max_events), waker })
    }
}

impl Backend for MioBackend {
    fn add(&mut self, fd: &mut dyn mio::event::Source, token: usize, mask: ReadinessMask) -> Result<()> {
        let interest = mask.to_interest().unwrap_or(Interest::READABLE);
        self.poll
            .registry()
            .register(fd, Token(token), interest)
            .map_err(|e| Error::reactor(format!("backend add failed: {e}")))
    }

    fn modify(&mut self, fd: &mut dyn mio::event::Source, token: usize, mask: ReadinessMask) -> Result<()> {
        let interest = mask.to_interest().unwrap_or(Interest::READABLE);
        self.poll
            .registry()
            .reregister(fd, Token(token), interest)
            .map_err(|e| Error::reactor(format!("backend modify failed: {e}")))
    }

    fn remove(&mut self, fd: &mut dyn mio::event::Source) -> Result<()> {
        self.poll
            .registry()
            .deregister(fd)
            .map_err(|e| Error::reactor(format!("backend remove failed: {e}")))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(Error::reactor(format!("backend wait failed: {e}"))),
        }

        let mut out = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            if event.token().0 == WAKE_TOKEN {
                continue;
            }
            out.push(ReadyEvent {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            });
        }
        Ok(out)
    }

    fn wake(&self) -> Result<()> {
        self.waker.wake().map_err(|e| Error::reactor(format!("wake failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_mask_interest_mapping() {
        assert_eq!(ReadinessMask::default().to_interest(), None);
        assert!(ReadinessMask::READABLE.to_interest().unwrap().is_readable());
        assert!(ReadinessMask::BOTH.to_interest().unwrap().is_writable());
    }

    #[test]
    fn wake_unblocks_wait() {
        let mut backend = MioBackend::new(64).unwrap();
        backend.wake().unwrap();
        let events = backend.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(events.is_empty());
    }
}
