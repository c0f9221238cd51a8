//! Top-level facade over [`EventLoop`] (§4.4 "Loop").
//!
//! `Squall` is the type most applications construct directly: it owns one
//! `EventLoop` (backend, timer heap, deferred-work queues, and every
//! transport/protocol registry) built from a [`Config`]. Everything an
//! application does — bind a TCP listener, connect MQTT, arm a timer — is a
//! method on `EventLoop` itself; `Squall` adds nothing but construction and
//! `Deref`/`DerefMut` so call sites read `squall.tcp_listen(...)` rather than
//! reaching through an extra field.

use crate::config::Config;
use crate::error::Result;
use crate::reactor::{EventLoop, RunMode, WakeHandle};
use std::ops::{Deref, DerefMut};

/// Owns one event loop. Not `Send`/`Sync` — only [`WakeHandle`], obtained
/// via [`Squall::wake_handle`], may cross thread boundaries (§5).
pub struct Squall {
    event_loop: EventLoop,
}

impl Squall {
    /// Build a loop from a [`Config`], failing if the I/O backend (mio's
    /// poller and waker) cannot be constructed.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self { event_loop: EventLoop::new(config)? })
    }

    /// Build a loop with every subsystem at its default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(Config::default())
    }

    /// Run until termination, per `mode` (§4.4's three run modes).
    pub fn run(&mut self, mode: RunMode) -> Result<()> {
        self.event_loop.run(mode)
    }

    /// A handle safe to hand to other threads: the only API surface that
    /// may cross a thread boundary (§5, §9 "Manual lifecycle").
    pub fn wake_handle(&self) -> WakeHandle {
        self.event_loop.wake_handle()
    }

    /// Borrow the underlying loop directly, for code that prefers the
    /// explicit name over `Deref`.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Mutably borrow the underlying loop directly.
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }
}

impl Deref for Squall {
    type Target = EventLoop;

    fn deref(&self) -> &Self::Target {
        &self.event_loop
    }
}

impl DerefMut for Squall {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.event_loop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_runs_default_mode_with_no_work() {
        let mut squall = Squall::with_defaults().unwrap();
        squall.run(RunMode::Default).unwrap();
        assert_eq!(squall.stats().turns, 1);
    }

    #[test]
    fn deref_exposes_event_loop_methods() {
        let squall = Squall::with_defaults().unwrap();
        assert_eq!(squall.stats().turns, 0);
        let _handle = squall.wake_handle();
    }
}
