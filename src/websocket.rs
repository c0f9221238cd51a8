//! WebSocket framing and handshake (RFC 6455), layered over either a TCP
//! stream or a TLS session — whichever the handle was built from (§4.8
//! transport layering).

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::mempool::PoolBuf;
use crate::reactor::EventLoop;
use crate::tcp::{ReadOutcome, TcpStreamId};
use crate::tls::{TlsId, TlsReadOutcome};
use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::warn;

slotmap::new_key_type! {
    pub struct WsId;
}

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Which lower-layer handle carries the bytes for this WebSocket session.
#[derive(Clone, Copy)]
pub enum Transport {
    Tcp(TcpStreamId),
    Tls(TlsId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0f {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<u16>, String),
}

pub enum WsEvent {
    Open,
    Message(WsMessage),
    Closed,
    Error(Error),
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Phase {
    ClientHandshakeSent,
    ServerAwaitingRequest,
    Open,
    Closing,
    Closed,
}

struct Fragmented {
    opcode: Opcode,
    payload: Vec<u8>,
}

pub(crate) struct WsState {
    transport: Transport,
    is_client: bool,
    phase: Phase,
    handshake_buf: Vec<u8>,
    client_key: String,
    recv_buf: Vec<u8>,
    fragmented: Option<Fragmented>,
    max_message_size: usize,
    require_masking: bool,
    event_cb: Option<Box<dyn FnMut(&mut EventLoop, WsId, WsEvent)>>,
    open_cb: Option<Box<dyn FnOnce(&mut EventLoop, WsId, Result<()>)>>,
    user_data: Option<Box<dyn std::any::Any + Send>>,
}

fn xorshift_next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn random_bytes(n: usize) -> Vec<u8> {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E3779B97F4A7C15)
        ^ (std::process::id() as u64).wrapping_mul(0xBF58476D1CE4E5B9);
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let word = xorshift_next(&mut state);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.truncate(n);
    out
}

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

fn build_client_request(host: &str, path: &str, client_key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {client_key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

fn build_server_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Extracts the `Sec-WebSocket-Key` header value from a raw HTTP request.
fn parse_client_key(request: &str) -> Option<String> {
    for line in request.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Sec-WebSocket-Key:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn parse_server_accept(response: &str) -> Option<String> {
    for line in response.split("\r\n") {
        if let Some(rest) = line.strip_prefix("Sec-WebSocket-Accept:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn encode_frame(opcode: Opcode, payload: &[u8], mask: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode.to_byte());

    let mask_bit = if mask { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if mask {
        let key = random_bytes(4);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    } else {
        out.extend_from_slice(payload);
    }
    out
}

struct DecodedFrame {
    fin: bool,
    opcode: Opcode,
    payload: Vec<u8>,
    consumed: usize,
}

/// Tries to decode exactly one frame from the front of `buf`. Returns
/// `Ok(None)` if more bytes are needed; the caller retries once more data
/// has arrived.
fn decode_frame(buf: &[u8], require_masking: bool) -> Result<Option<DecodedFrame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_byte(buf[0]).ok_or_else(|| Error::protocol("unknown websocket opcode"))?;
    let masked = buf[1] & 0x80 != 0;
    if require_masking && !masked {
        return Err(Error::protocol("unmasked client frame rejected"));
    }

    let mut offset = 2usize;
    let base_len = (buf[1] & 0x7f) as u64;
    let payload_len: u64 = if base_len == 126 {
        if buf.len() < offset + 2 {
            return Ok(None);
        }
        let n = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u64;
        offset += 2;
        n
    } else if base_len == 127 {
        if buf.len() < offset + 8 {
            return Ok(None);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[offset..offset + 8]);
        offset += 8;
        u64::from_be_bytes(bytes)
    } else {
        base_len
    };

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = payload_len as usize;
    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    Ok(Some(DecodedFrame { fin, opcode, payload, consumed: offset + payload_len }))
}

impl EventLoop {
    /// Start a client handshake over an already-connected transport.
    pub fn ws_connect(
        &mut self,
        transport: Transport,
        host: &str,
        path: &str,
        open_cb: impl FnOnce(&mut EventLoop, WsId, Result<()>) + 'static,
        event_cb: impl FnMut(&mut EventLoop, WsId, WsEvent) + 'static,
    ) -> Result<WsId> {
        let cfg = self.config().websocket.clone();
        let client_key = base64::engine::general_purpose::STANDARD.encode(random_bytes(16));
        let id = self.ws.insert(WsState {
            transport,
            is_client: true,
            phase: Phase::ClientHandshakeSent,
            handshake_buf: Vec::new(),
            client_key: client_key.clone(),
            recv_buf: Vec::new(),
            fragmented: None,
            max_message_size: cfg.max_message_size,
            require_masking: false,
            event_cb: Some(Box::new(event_cb)),
            open_cb: Some(Box::new(open_cb)),
            user_data: None,
        });
        self.wire_transport(transport, id)?;
        let request = build_client_request(host, path, &client_key);
        self.transport_write(transport, request.into_bytes());
        Ok(id)
    }

    /// Wait for a client handshake request over an already-accepted
    /// transport, then complete the upgrade.
    pub fn ws_accept(
        &mut self,
        transport: Transport,
        open_cb: impl FnOnce(&mut EventLoop, WsId, Result<()>) + 'static,
        event_cb: impl FnMut(&mut EventLoop, WsId, WsEvent) + 'static,
    ) -> Result<WsId> {
        let cfg = self.config().websocket.clone();
        let id = self.ws.insert(WsState {
            transport,
            is_client: false,
            phase: Phase::ServerAwaitingRequest,
            handshake_buf: Vec::new(),
            client_key: String::new(),
            recv_buf: Vec::new(),
            fragmented: None,
            max_message_size: cfg.max_message_size,
            require_masking: cfg.require_masking,
            event_cb: Some(Box::new(event_cb)),
            open_cb: Some(Box::new(open_cb)),
            user_data: None,
        });
        self.wire_transport(transport, id)?;
        Ok(id)
    }

    fn wire_transport(&mut self, transport: Transport, id: WsId) -> Result<()> {
        match transport {
            Transport::Tcp(tcp) => {
                let pool = self.pool();
                self.tcp_read_start(
                    tcp,
                    move |_lp, n| pool.alloc_buf(n).expect("pool alloc for ws bytes"),
                    move |lp, _id, outcome| match outcome {
                        ReadOutcome::Data(buf) => lp.ws_feed(id, &buf),
                        ReadOutcome::Eof => lp.ws_transport_closed(id),
                        ReadOutcome::Error(e) => lp.ws_transport_failed(id, e),
                    },
                )
            }
            Transport::Tls(tls) => self.tls_read_start(tls, move |lp, _id, outcome| match outcome {
                TlsReadOutcome::Data(buf) => lp.ws_feed(id, &buf),
                TlsReadOutcome::Eof => lp.ws_transport_closed(id),
                TlsReadOutcome::Error(e) => lp.ws_transport_failed(id, e),
            }),
        }
    }

    fn transport_write(&mut self, transport: Transport, data: Vec<u8>) {
        match transport {
            Transport::Tcp(tcp) => {
                let _ = self.tcp_write(tcp, data, |_, _, _| {});
            }
            Transport::Tls(tls) => {
                let _ = self.tls_write(tls, data, |_, _, _| {});
            }
        }
    }

    fn transport_close(&mut self, transport: Transport) {
        match transport {
            Transport::Tcp(tcp) => self.tcp_close(tcp, |_, _| {}),
            Transport::Tls(tls) => self.tls_close(tls, |_, _| {}),
        }
    }

    pub fn ws_send_text(&mut self, id: WsId, text: &str) -> Result<()> {
        self.ws_send_frame(id, Opcode::Text, text.as_bytes())
    }

    pub fn ws_send_binary(&mut self, id: WsId, data: &[u8]) -> Result<()> {
        self.ws_send_frame(id, Opcode::Binary, data)
    }

    fn ws_send_frame(&mut self, id: WsId, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let state = self.ws.get(id).ok_or_else(|| Error::argument("unknown websocket session"))?;
        if state.phase != Phase::Open {
            return Err(Error::protocol("websocket session is not open"));
        }
        let frame = encode_frame(opcode, payload, state.is_client);
        let transport = state.transport;
        self.transport_write(transport, frame);
        Ok(())
    }

    /// Attach opaque application data to a session handle (§3 "Handle").
    pub fn ws_set_user_data<T: std::any::Any + Send>(&mut self, id: WsId, data: T) {
        if let Some(state) = self.ws.get_mut(id) {
            state.user_data = Some(Box::new(data));
        }
    }

    pub fn ws_user_data<T: std::any::Any + Send>(&self, id: WsId) -> Option<&T> {
        self.ws.get(id)?.user_data.as_ref()?.downcast_ref()
    }

    pub fn ws_user_data_mut<T: std::any::Any + Send>(&mut self, id: WsId) -> Option<&mut T> {
        self.ws.get_mut(id)?.user_data.as_mut()?.downcast_mut()
    }

    pub fn ws_close(&mut self, id: WsId, code: u16, reason: &str) {
        let Some(state) = self.ws.get_mut(id) else { return };
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closing;
        let is_client = state.is_client;
        let transport = state.transport;
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        let frame = encode_frame(Opcode::Close, &payload, is_client);
        self.transport_write(transport, frame);
        self.transport_close(transport);
        self.ws.remove(id);
    }

    fn ws_feed(&mut self, id: WsId, data: &[u8]) {
        let Some(state) = self.ws.get_mut(id) else { return };
        match state.phase {
            Phase::ClientHandshakeSent => self.feed_client_handshake(id, data),
            Phase::ServerAwaitingRequest => self.feed_server_handshake(id, data),
            Phase::Open | Phase::Closing => self.feed_frames(id, data),
            Phase::Closed => {}
        }
    }

    fn feed_client_handshake(&mut self, id: WsId, data: &[u8]) {
        let Some(state) = self.ws.get_mut(id) else { return };
        state.handshake_buf.extend_from_slice(data);
        let Some(end) = find_header_terminator(&state.handshake_buf) else { return };
        let response = String::from_utf8_lossy(&state.handshake_buf[..end]).to_string();
        let leftover = state.handshake_buf[end..].to_vec();
        let accept = parse_server_accept(&response);
        let expected = accept_key(&state.client_key);

        let ok = response.starts_with("HTTP/1.1 101") && accept.as_deref() == Some(expected.as_str());
        state.phase = if ok { Phase::Open } else { Phase::Closed };
        let cb = state.open_cb.take();
        if ok {
            let Some(state) = self.ws.get_mut(id) else { return };
            state.recv_buf = leftover;
        }
        if let Some(cb) = cb {
            let result = if ok { Ok(()) } else { Err(Error::protocol("websocket handshake rejected")) };
            cb(self, id, result);
        }
        if ok {
            self.emit_ws_event(id, WsEvent::Open);
            let Some(state) = self.ws.get_mut(id) else { return };
            let remaining = std::mem::take(&mut state.recv_buf);
            if !remaining.is_empty() {
                self.feed_frames(id, &remaining);
            }
        } else {
            self.ws.remove(id);
        }
    }

    fn feed_server_handshake(&mut self, id: WsId, data: &[u8]) {
        let Some(state) = self.ws.get_mut(id) else { return };
        state.handshake_buf.extend_from_slice(data);
        let Some(end) = find_header_terminator(&state.handshake_buf) else { return };
        let request = String::from_utf8_lossy(&state.handshake_buf[..end]).to_string();
        let leftover = state.handshake_buf[end..].to_vec();
        let transport = state.transport;

        let Some(client_key) = parse_client_key(&request) else {
            self.ws.remove(id);
            self.transport_close(transport);
            return;
        };
        let accept = accept_key(&client_key);
        let response = build_server_response(&accept);
        self.transport_write(transport, response.into_bytes());

        let Some(state) = self.ws.get_mut(id) else { return };
        state.phase = Phase::Open;
        let cb = state.open_cb.take();
        state.recv_buf = leftover;
        if let Some(cb) = cb {
            cb(self, id, Ok(()));
        }
        self.emit_ws_event(id, WsEvent::Open);
        let Some(state) = self.ws.get_mut(id) else { return };
        let remaining = std::mem::take(&mut state.recv_buf);
        if !remaining.is_empty() {
            self.feed_frames(id, &remaining);
        }
    }

    fn feed_frames(&mut self, id: WsId, data: &[u8]) {
        let Some(state) = self.ws.get_mut(id) else { return };
        state.recv_buf.extend_from_slice(data);

        loop {
            let Some(state) = self.ws.get_mut(id) else { return };
            if state.recv_buf.len() > state.max_message_size.saturating_mul(2) {
                let transport = state.transport;
                self.transport_close(transport);
                self.ws.remove(id);
                return;
            }
            let decoded = match decode_frame(&state.recv_buf, state.require_masking) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    let transport = state.transport;
                    self.emit_ws_event(id, WsEvent::Error(e));
                    self.transport_close(transport);
                    self.ws.remove(id);
                    return;
                }
            };
            state.recv_buf.drain(..decoded.consumed);
            self.handle_decoded_frame(id, decoded);
        }
    }

    fn handle_decoded_frame(&mut self, id: WsId, frame: DecodedFrame) {
        if frame.opcode.is_control() {
            match frame.opcode {
                Opcode::Ping => {
                    let Some(state) = self.ws.get(id) else { return };
                    let transport = state.transport;
                    let is_client = state.is_client;
                    let reply = encode_frame(Opcode::Pong, &frame.payload, is_client);
                    self.transport_write(transport, reply);
                    self.emit_ws_event(id, WsEvent::Message(WsMessage::Ping(frame.payload)));
                }
                Opcode::Pong => {
                    self.emit_ws_event(id, WsEvent::Message(WsMessage::Pong(frame.payload)));
                }
                Opcode::Close => {
                    let code = (frame.payload.len() >= 2)
                        .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
                    let reason = if frame.payload.len() > 2 {
                        String::from_utf8_lossy(&frame.payload[2..]).to_string()
                    } else {
                        String::new()
                    };
                    self.emit_ws_event(id, WsEvent::Message(WsMessage::Close(code, reason)));
                    let Some(state) = self.ws.get_mut(id) else { return };
                    let transport = state.transport;
                    state.phase = Phase::Closed;
                    self.transport_close(transport);
                    self.emit_ws_event(id, WsEvent::Closed);
                    self.ws.remove(id);
                }
                _ => unreachable!("non-control opcode in control branch"),
            }
            return;
        }

        let Some(state) = self.ws.get_mut(id) else { return };
        if frame.opcode == Opcode::Continuation {
            let Some(pending) = state.fragmented.as_mut() else {
                self.emit_ws_event(id, WsEvent::Error(Error::protocol("continuation without preceding frame")));
                return;
            };
            pending.payload.extend_from_slice(&frame.payload);
            if frame.fin {
                let Fragmented { opcode, payload } = state.fragmented.take().unwrap();
                self.deliver_message(id, opcode, payload);
            }
        } else if frame.fin {
            self.deliver_message(id, frame.opcode, frame.payload);
        } else {
            state.fragmented = Some(Fragmented { opcode: frame.opcode, payload: frame.payload });
        }
    }

    fn deliver_message(&mut self, id: WsId, opcode: Opcode, payload: Vec<u8>) {
        let message = match opcode {
            Opcode::Text => match String::from_utf8(payload) {
                Ok(text) => WsMessage::Text(text),
                Err(_) => {
                    self.emit_ws_event(id, WsEvent::Error(Error::protocol("invalid utf-8 in text frame")));
                    return;
                }
            },
            Opcode::Binary => WsMessage::Binary(payload),
            _ => return,
        };
        self.emit_ws_event(id, WsEvent::Message(message));
    }

    fn emit_ws_event(&mut self, id: WsId, event: WsEvent) {
        let Some(state) = self.ws.get_mut(id) else { return };
        let Some(mut cb) = state.event_cb.take() else { return };
        cb(self, id, event);
        if let Some(state) = self.ws.get_mut(id) {
            if state.event_cb.is_none() {
                state.event_cb = Some(cb);
            }
        }
    }

    fn ws_transport_closed(&mut self, id: WsId) {
        self.emit_ws_event(id, WsEvent::Closed);
        self.ws.remove(id);
    }

    fn ws_transport_failed(&mut self, id: WsId, err: Error) {
        warn!(?id, error = %err, "websocket transport failed");
        self.emit_ws_event(id, WsEvent::Error(err));
        self.ws.remove(id);
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn encode_then_decode_unmasked_text_frame() {
        let frame = encode_frame(Opcode::Text, b"hello", false);
        let decoded = decode_frame(&frame, false).unwrap().unwrap();
        assert_eq!(decoded.opcode, Opcode::Text);
        assert_eq!(decoded.payload, b"hello");
        assert!(decoded.fin);
        assert_eq!(decoded.consumed, frame.len());
    }

    #[test]
    fn encode_then_decode_masked_frame_round_trips() {
        let frame = encode_frame(Opcode::Binary, b"abc123", true);
        let decoded = decode_frame(&frame, true).unwrap().unwrap();
        assert_eq!(decoded.payload, b"abc123");
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let frame = encode_frame(Opcode::Text, b"hello world", false);
        let partial = &frame[..frame.len() - 2];
        assert!(decode_frame(partial, false).unwrap().is_none());
    }

    #[test]
    fn rejects_unmasked_frame_when_masking_required() {
        let frame = encode_frame(Opcode::Text, b"hi", false);
        assert!(decode_frame(&frame, true).is_err());
    }
}
