//! MQTT v3.1 / v3.1.1 / v5 protocol engine (§4.8, §4.9): a streaming wire
//! parser and symmetric encoder (`parser`, `encoder`), and a client state
//! machine (`client`) that drives connect/keepalive/QoS/subscribe over
//! whichever transport (TCP, TLS, WebSocket, Secure WebSocket) the connect
//! options select.

pub mod client;
pub mod encoder;
pub mod parser;

pub use client::{ConnectOptions, ConnectResult, Message, MqttId, ReconnectOptions, Will};
pub use parser::{Packet, ProtocolVersion};
