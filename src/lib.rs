//! Squall: a single-threaded async I/O and messaging runtime.
//!
//! Squall is a reactor-style event loop — one backend, one active handle
//! set, one timer heap, one deferred-work queue per loop — with a family of
//! transport and protocol components layered on top: TCP/UDP/TLS transport
//! handles, a WebSocket frame codec and handshake, and an MQTT 3.1/3.1.1/5
//! client (wire parser, encoder, QoS 1/2 pipelines, keepalive, and
//! auto-reconnect with subscription replay).
//!
//! The crate is organized bottom-up, matching the layering in the design
//! document:
//!
//! - [`mempool`] / [`collections`] — the slab allocator and the normal/
//!   SPSC/MPSC queue family everything else is built from.
//! - [`address`] — typed IPv4/IPv6 address parsing.
//! - [`backend`] / [`reactor`] — the I/O readiness multiplexer and the
//!   [`reactor::EventLoop`] that owns it, the timer heap, and the
//!   deferred-work queues.
//! - [`timer`] / [`tcp`] / [`udp`] / [`dns`] — the transport/timer/
//!   resolution primitives registered with a loop. `tcp`/`udp` carry a
//!   two-phase close flag and an opaque per-handle user-data slot.
//! - [`ssl`] / [`tls`] — the rustls adapter marrying a TCP stream to a TLS
//!   session, with its own close flag and user-data slot.
//! - [`websocket`] — RFC 6455 framing and the upgrade handshake, same
//!   close/user-data pattern.
//! - [`mqtt`] — the streaming wire parser/encoder and the client state
//!   machine.
//!
//! [`runtime::Squall`] is the top-level facade most applications construct
//! directly; it wraps [`reactor::EventLoop`] with the crate's `Config`.

#![warn(rust_2018_idioms)]
#![allow(clippy::type_complexity)]

pub mod address;
pub mod backend;
pub mod collections;
pub mod config;
pub mod dns;
pub mod error;
pub mod mempool;
pub mod mqtt;
pub mod reactor;
pub mod runtime;
pub mod ssl;
pub mod tcp;
pub mod timer;
pub mod tls;
pub mod udp;
pub mod websocket;

pub use config::Config;
pub use error::{Error, Result};
pub use reactor::{EventLoop, RunMode, WakeHandle};
pub use runtime::Squall;
