//! MQTT packet encoding (§4.8): builder functions that return an owned
//! [`Bytes`] per packet, rather than the C-style "query the size, then fill
//! a caller-provided buffer" two-pass contract the spec describes literally
//! — see DESIGN.md for why that deviation is worth taking here.

use super::parser::{encode_remaining_length, ProtocolVersion};
use bytes::{BufMut, Bytes, BytesMut};

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

fn put_utf8(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn finish(packet_type: u8, flags: u8, body: BytesMut) -> Bytes {
    let remaining = encode_remaining_length(body.len()).expect("mqtt packet exceeds varint ceiling");
    let mut out = BytesMut::with_capacity(1 + remaining.len() + body.len());
    out.put_u8((packet_type << 4) | flags);
    out.put_slice(&remaining);
    out.put_slice(&body);
    out.freeze()
}

/// An outgoing will message, mirroring [`super::client::Will`] without
/// making the encoder depend on the client module's type.
pub struct WillPayload<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: u8,
    pub retain: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn encode_connect(
    version: ProtocolVersion,
    client_id: &str,
    clean_session: bool,
    keepalive_sec: u16,
    will: Option<&WillPayload<'_>>,
    username: Option<&str>,
    password: Option<&[u8]>,
) -> Bytes {
    let mut body = BytesMut::new();
    let (proto_name, proto_level) = match version {
        ProtocolVersion::V31 => ("MQIsdp", 3u8),
        ProtocolVersion::V311 => ("MQTT", 4u8),
        ProtocolVersion::V5 => ("MQTT", 5u8),
    };
    put_utf8(&mut body, proto_name);
    body.put_u8(proto_level);

    let mut flags = 0u8;
    if clean_session {
        flags |= 0x02;
    }
    if let Some(w) = will {
        flags |= 0x04;
        flags |= (w.qos & 0x03) << 3;
        if w.retain {
            flags |= 0x20;
        }
    }
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }
    body.put_u8(flags);
    body.put_u16(keepalive_sec);

    if version == ProtocolVersion::V5 {
        // No properties set on outbound CONNECT; an empty property block
        // is a single zero-length varint.
        body.put_u8(0);
    }

    put_utf8(&mut body, client_id);
    if let Some(w) = will {
        if version == ProtocolVersion::V5 {
            body.put_u8(0);
        }
        put_utf8(&mut body, w.topic);
        put_binary(&mut body, w.payload);
    }
    if let Some(u) = username {
        put_utf8(&mut body, u);
    }
    if let Some(p) = password {
        put_binary(&mut body, p);
    }

    finish(CONNECT, 0, body)
}

#[allow(clippy::too_many_arguments)]
pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    qos: u8,
    retain: bool,
    dup: bool,
    packet_id: Option<u16>,
    version: ProtocolVersion,
) -> Bytes {
    let mut body = BytesMut::new();
    put_utf8(&mut body, topic);
    if let Some(id) = packet_id {
        body.put_u16(id);
    }
    if version == ProtocolVersion::V5 {
        body.put_u8(0);
    }
    body.put_slice(payload);

    let mut flags = (qos & 0x03) << 1;
    if retain {
        flags |= 0x01;
    }
    if dup {
        flags |= 0x08;
    }
    finish(PUBLISH, flags, body)
}

fn encode_simple_ack(packet_type: u8, flags: u8, packet_id: u16, reason_code: u8, version: ProtocolVersion) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    // Only emit a reason code (and skip properties) when it's non-success
    // on v5; v3.x never carries one and a success v5 ack is shorter without it.
    if version == ProtocolVersion::V5 && reason_code != 0 {
        body.put_u8(reason_code);
    }
    finish(packet_type, flags, body)
}

pub fn encode_puback(packet_id: u16, reason_code: u8, version: ProtocolVersion) -> Bytes {
    encode_simple_ack(PUBACK, 0, packet_id, reason_code, version)
}

pub fn encode_pubrec(packet_id: u16, reason_code: u8, version: ProtocolVersion) -> Bytes {
    encode_simple_ack(PUBREC, 0, packet_id, reason_code, version)
}

pub fn encode_pubrel(packet_id: u16, reason_code: u8, version: ProtocolVersion) -> Bytes {
    encode_simple_ack(PUBREL, 0x02, packet_id, reason_code, version)
}

pub fn encode_pubcomp(packet_id: u16, reason_code: u8, version: ProtocolVersion) -> Bytes {
    encode_simple_ack(PUBCOMP, 0, packet_id, reason_code, version)
}

pub fn encode_subscribe(packet_id: u16, filters: &[(String, u8)], version: ProtocolVersion) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    if version == ProtocolVersion::V5 {
        body.put_u8(0);
    }
    for (filter, qos) in filters {
        put_utf8(&mut body, filter);
        body.put_u8(*qos);
    }
    finish(SUBSCRIBE, 0x02, body)
}

pub fn encode_unsubscribe(packet_id: u16, filters: &[String], version: ProtocolVersion) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    if version == ProtocolVersion::V5 {
        body.put_u8(0);
    }
    for filter in filters {
        put_utf8(&mut body, filter);
    }
    finish(UNSUBSCRIBE, 0x02, body)
}

pub fn encode_pingreq() -> Bytes {
    finish(PINGREQ, 0, BytesMut::new())
}

pub fn encode_disconnect(reason_code: u8, version: ProtocolVersion) -> Bytes {
    let mut body = BytesMut::new();
    if version == ProtocolVersion::V5 && reason_code != 0 {
        body.put_u8(reason_code);
    }
    finish(DISCONNECT, 0, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::parser::{Packet, Parser};

    #[test]
    fn connect_round_trips_through_the_parser() {
        let bytes = encode_connect(ProtocolVersion::V311, "client-1", true, 30, None, Some("user"), Some(b"pw"));
        let mut parser = Parser::new(ProtocolVersion::V311, 1024);
        parser.feed(&bytes);
        let Packet::Connect(c) = parser.poll().unwrap().unwrap() else { panic!("expected connect") };
        assert_eq!(c.client_id, "client-1");
        assert!(c.clean_session);
        assert_eq!(c.keepalive_sec, 30);
        assert_eq!(c.username.as_deref(), Some("user"));
        assert_eq!(c.password.as_deref(), Some(&b"pw"[..]));
    }

    #[test]
    fn connect_with_will_round_trips() {
        let will = WillPayload { topic: "last/will", payload: b"bye", qos: 1, retain: true };
        let bytes = encode_connect(ProtocolVersion::V311, "client-2", false, 60, Some(&will), None, None);
        let mut parser = Parser::new(ProtocolVersion::V311, 1024);
        parser.feed(&bytes);
        let Packet::Connect(c) = parser.poll().unwrap().unwrap() else { panic!("expected connect") };
        let w = c.will.expect("will should be present");
        assert_eq!(w.topic, "last/will");
        assert_eq!(w.payload, b"bye");
        assert_eq!(w.qos, 1);
        assert!(w.retain);
    }

    #[test]
    fn publish_qos1_round_trips_with_packet_id() {
        let bytes = encode_publish("a/b", b"payload", 1, false, false, Some(42), ProtocolVersion::V311);
        let mut parser = Parser::new(ProtocolVersion::V311, 1024);
        parser.feed(&bytes);
        let Packet::Publish(p) = parser.poll().unwrap().unwrap() else { panic!("expected publish") };
        assert_eq!(p.topic, "a/b");
        assert_eq!(p.packet_id, Some(42));
        assert_eq!(p.qos, 1);
        assert_eq!(p.payload, b"payload");
    }

    #[test]
    fn subscribe_round_trips_filters() {
        let filters = vec![("topic/+".to_string(), 1u8), ("#".to_string(), 0u8)];
        let bytes = encode_subscribe(7, &filters, ProtocolVersion::V311);
        let mut parser = Parser::new(ProtocolVersion::V311, 1024);
        parser.feed(&bytes);
        let Packet::Subscribe(s) = parser.poll().unwrap().unwrap() else { panic!("expected subscribe") };
        assert_eq!(s.packet_id, 7);
        assert_eq!(s.filters, filters);
    }

    #[test]
    fn pingreq_is_two_bytes() {
        assert_eq!(&encode_pingreq()[..], &[0xC0, 0x00]);
    }
}
