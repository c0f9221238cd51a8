//! Streaming MQTT wire parser and the packet/property types it produces
//! (§4.8, §6.1).
//!
//! The parser models the fixed-header → remaining-length → variable-header
//! + payload state machine as a single incremental function over an
//! append-only accumulator (`Parser::feed` + `Parser::poll`) rather than an
//! explicit resumable state enum: `BytesMut` already remembers everything a
//! partially-received packet needs between calls, so there is no extra
//! state to thread through. `Parser::is_errored`/`reset` still expose the
//! FIXED_HEADER/ERROR distinction the spec calls for (§8 property 10).

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};

pub use crate::config::MqttVersion as ProtocolVersion;

/// Maximum remaining-length value the varint encoding can express (§4.8
/// payload limit, §6.1 fixed header: 4 varint bytes, 7 bits each).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Parses (or fails to parse) a remaining-length varint from the front of
/// `buf`. Returns `Ok(None)` when more bytes are needed, `Ok(Some((value,
/// bytes_consumed)))` once complete, and `Err` if a 5th continuation byte
/// would be required (malformed — the spec caps this at 4 bytes).
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value: usize = 0;
    let mut multiplier: usize = 1;
    for (i, &byte) in buf.iter().enumerate().take(4) {
        value += (byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(Error::protocol("mqtt remaining-length varint exceeds 4 bytes"));
    }
    Ok(None)
}

/// Encodes `len` as the MQTT remaining-length varint (little-endian
/// base-128, continuation bit in the high bit of every byte but the last).
pub fn encode_remaining_length(len: usize) -> Result<Vec<u8>> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::protocol(format!("mqtt remaining length {len} exceeds the 256 MiB ceiling")));
    }
    let mut out = Vec::with_capacity(4);
    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
}

/// Property id -> value shape, per the v5 property table (§4.8). Returns the
/// number of bytes the *value* occupies (not counting the id byte itself),
/// so unknown ids can be skipped without understanding their semantics.
fn property_value_len(id: u8, buf: &[u8]) -> Result<usize> {
    match id {
        // 4-byte fixed: Session-Expiry-Interval, Will-Delay-Interval, Maximum-Packet-Size.
        0x11 | 0x18 | 0x27 => Ok(4),
        // 2-byte fixed: Receive-Maximum, Topic-Alias-Maximum, Topic-Alias, Server-Keep-Alive.
        0x21 | 0x22 | 0x23 | 0x13 => Ok(2),
        // 1-byte fixed: Payload-Format-Indicator and the boolean capability flags.
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => Ok(1),
        // UTF-8 strings: 2-byte length prefix + bytes.
        0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => {
            let (_, n) = read_utf8_len(buf)?;
            Ok(n)
        }
        // Binary data: 2-byte length prefix + bytes.
        0x09 | 0x16 => {
            let (_, n) = read_utf8_len(buf)?;
            Ok(n)
        }
        // Varint: Subscription-Identifier.
        0x0B => {
            let (_, n) = decode_remaining_length(buf)?.ok_or_else(|| {
                Error::protocol("truncated varint property value")
            })?;
            Ok(n)
        }
        // User-Property: a UTF-8 string pair.
        0x26 => {
            let (_, key_len) = read_utf8_len(buf)?;
            let (_, val_len) = read_utf8_len(&buf[key_len..])?;
            Ok(key_len + val_len)
        }
        _ => Err(Error::protocol(format!("unknown mqtt v5 property id 0x{id:02x}"))),
    }
}

fn read_utf8_len(buf: &[u8]) -> Result<(usize, usize)> {
    if buf.len() < 2 {
        return Err(Error::protocol("truncated utf-8 length prefix"));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Err(Error::protocol("truncated utf-8 string"));
    }
    Ok((len, 2 + len))
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *buf.get(*pos).ok_or_else(|| Error::protocol("truncated mqtt packet (u8)"))?;
    *pos += 1;
    Ok(b)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    if buf.len() < *pos + 2 {
        return Err(Error::protocol("truncated mqtt packet (u16)"));
    }
    let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn read_utf8(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_u16(buf, pos)? as usize;
    if buf.len() < *pos + len {
        return Err(Error::protocol("truncated mqtt utf-8 field"));
    }
    let s = String::from_utf8(buf[*pos..*pos + len].to_vec())
        .map_err(|_| Error::protocol("mqtt utf-8 field is not valid utf-8"))?;
    *pos += len;
    Ok(s)
}

fn read_binary(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = read_u16(buf, pos)? as usize;
    if buf.len() < *pos + len {
        return Err(Error::protocol("truncated mqtt binary field"));
    }
    let v = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(v)
}

/// Reads a v5 property block (varint length + TLV stream) starting at
/// `*pos`, extracting the handful of properties actively consumed (§4.8)
/// and skipping the rest via the length table.
fn read_properties(buf: &[u8], pos: &mut usize) -> Result<Properties> {
    let (block_len, n) = decode_remaining_length(&buf[*pos..])?
        .ok_or_else(|| Error::protocol("truncated mqtt v5 property length"))?;
    *pos += n;
    let end = *pos + block_len;
    if buf.len() < end {
        return Err(Error::protocol("truncated mqtt v5 property block"));
    }
    let mut props = Properties::default();
    while *pos < end {
        let id = read_u8(buf, pos)?;
        let value_len = property_value_len(id, &buf[*pos..])?;
        if *pos + value_len > end {
            return Err(Error::protocol("mqtt v5 property value crosses block boundary"));
        }
        match id {
            0x11 => {
                props.session_expiry_interval =
                    Some(u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap()));
            }
            0x21 => {
                props.receive_maximum = Some(u16::from_be_bytes(buf[*pos..*pos + 2].try_into().unwrap()));
            }
            _ => {}
        }
        *pos += value_len;
    }
    Ok(props)
}

#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub version: ProtocolVersion,
    pub clean_session: bool,
    pub keepalive_sec: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: Properties,
}

#[derive(Debug, Clone)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: u8,
    pub properties: Properties,
}

impl ConnAckPacket {
    pub fn accepted(&self) -> bool {
        self.return_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub packet_id: Option<u16>,
    pub qos: u8,
    pub dup: bool,
    pub retain: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, u8)>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck { packet_id: u16, reason_code: u8 },
    PubRec { packet_id: u16, reason_code: u8 },
    PubRel { packet_id: u16, reason_code: u8 },
    PubComp { packet_id: u16, reason_code: u8 },
    Subscribe(SubscribePacket),
    SubAck { packet_id: u16, reason_codes: Vec<u8> },
    Unsubscribe(UnsubscribePacket),
    UnsubAck { packet_id: u16, reason_codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect { reason_code: u8 },
    Auth { reason_code: u8 },
}

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;
const AUTH: u8 = 15;

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut pos = 0;
    let name = read_utf8(body, &mut pos)?;
    let level = read_u8(body, &mut pos)?;
    let version = match (name.as_str(), level) {
        ("MQTT", 5) => ProtocolVersion::V5,
        ("MQTT", 4) => ProtocolVersion::V311,
        ("MQIsdp", 3) => ProtocolVersion::V31,
        _ => return Err(Error::protocol(format!("unrecognised mqtt protocol name {name:?} level {level}"))),
    };
    let flags = read_u8(body, &mut pos)?;
    let user_name_flag = flags & 0x80 != 0;
    let password_flag = flags & 0x40 != 0;
    let will_retain = flags & 0x20 != 0;
    let will_qos = (flags >> 3) & 0x03;
    let will_flag = flags & 0x04 != 0;
    let clean_session = flags & 0x02 != 0;
    let keepalive_sec = read_u16(body, &mut pos)?;

    let properties = if version == ProtocolVersion::V5 { read_properties(body, &mut pos)? } else { Properties::default() };

    let client_id = read_utf8(body, &mut pos)?;
    let will = if will_flag {
        if version == ProtocolVersion::V5 {
            let _will_props = read_properties(body, &mut pos)?;
        }
        let topic = read_utf8(body, &mut pos)?;
        let payload = read_binary(body, &mut pos)?;
        Some(Will { topic, payload, qos: will_qos, retain: will_retain })
    } else {
        None
    };
    let username = if user_name_flag { Some(read_utf8(body, &mut pos)?) } else { None };
    let password = if password_flag { Some(read_binary(body, &mut pos)?) } else { None };

    Ok(Packet::Connect(ConnectPacket {
        version,
        clean_session,
        keepalive_sec,
        client_id,
        will,
        username,
        password,
        properties,
    }))
}

fn decode_connack(body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let mut pos = 0;
    let ack_flags = read_u8(body, &mut pos)?;
    let return_code = read_u8(body, &mut pos)?;
    let properties = if version == ProtocolVersion::V5 && body.len() > pos {
        read_properties(body, &mut pos)?
    } else {
        Properties::default()
    };
    Ok(Packet::ConnAck(ConnAckPacket { session_present: ack_flags & 0x01 != 0, return_code, properties }))
}

fn decode_publish(body: &[u8], flags: u8, version: ProtocolVersion) -> Result<Packet> {
    let mut pos = 0;
    let dup = flags & 0x08 != 0;
    let qos = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;
    let topic = read_utf8(body, &mut pos)?;
    let packet_id = if qos > 0 { Some(read_u16(body, &mut pos)?) } else { None };
    if version == ProtocolVersion::V5 {
        let _ = read_properties(body, &mut pos)?;
    }
    let payload = body[pos..].to_vec();
    Ok(Packet::Publish(PublishPacket { topic, packet_id, qos, dup, retain, payload }))
}

/// Shared by PUBACK/PUBREC/PUBREL/PUBCOMP: packet id, then (v5 only, and
/// only when the remaining length says there's more) a reason code and an
/// optional property block (§4.8 "both optional if remaining length allows").
fn decode_ack_with_reason(body: &[u8], version: ProtocolVersion) -> Result<(u16, u8)> {
    let mut pos = 0;
    let packet_id = read_u16(body, &mut pos)?;
    let reason_code = if version == ProtocolVersion::V5 && body.len() > pos {
        let rc = read_u8(body, &mut pos)?;
        if body.len() > pos {
            let _ = read_properties(body, &mut pos)?;
        }
        rc
    } else {
        0
    };
    Ok((packet_id, reason_code))
}

fn decode_subscribe(body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let mut pos = 0;
    let packet_id = read_u16(body, &mut pos)?;
    if version == ProtocolVersion::V5 {
        let _ = read_properties(body, &mut pos)?;
    }
    let mut filters = Vec::new();
    while pos < body.len() {
        let filter = read_utf8(body, &mut pos)?;
        let options = read_u8(body, &mut pos)?;
        filters.push((filter, options));
    }
    Ok(Packet::Subscribe(SubscribePacket { packet_id, filters }))
}

fn decode_suback(body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let mut pos = 0;
    let packet_id = read_u16(body, &mut pos)?;
    if version == ProtocolVersion::V5 {
        let _ = read_properties(body, &mut pos)?;
    }
    Ok(Packet::SubAck { packet_id, reason_codes: body[pos..].to_vec() })
}

fn decode_unsubscribe(body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let mut pos = 0;
    let packet_id = read_u16(body, &mut pos)?;
    if version == ProtocolVersion::V5 {
        let _ = read_properties(body, &mut pos)?;
    }
    let mut filters = Vec::new();
    while pos < body.len() {
        filters.push(read_utf8(body, &mut pos)?);
    }
    Ok(Packet::Unsubscribe(UnsubscribePacket { packet_id, filters }))
}

fn decode_unsuback(body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let mut pos = 0;
    let packet_id = read_u16(body, &mut pos)?;
    let reason_codes = if version == ProtocolVersion::V5 {
        let _ = read_properties(body, &mut pos)?;
        body[pos..].to_vec()
    } else {
        Vec::new()
    };
    Ok(Packet::UnsubAck { packet_id, reason_codes })
}

fn decode_disconnect(body: &[u8]) -> Result<Packet> {
    if body.is_empty() {
        return Ok(Packet::Disconnect { reason_code: 0 });
    }
    let mut pos = 0;
    let reason_code = read_u8(body, &mut pos)?;
    Ok(Packet::Disconnect { reason_code })
}

fn decode_auth(body: &[u8]) -> Result<Packet> {
    if body.is_empty() {
        return Ok(Packet::Auth { reason_code: 0 });
    }
    let mut pos = 0;
    let reason_code = read_u8(body, &mut pos)?;
    Ok(Packet::Auth { reason_code })
}

fn decode_packet(type_and_flags: u8, body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let packet_type = type_and_flags >> 4;
    let flags = type_and_flags & 0x0f;
    match packet_type {
        CONNECT => decode_connect(body),
        CONNACK => decode_connack(body, version),
        PUBLISH => decode_publish(body, flags, version),
        PUBACK => {
            let (packet_id, reason_code) = decode_ack_with_reason(body, version)?;
            Ok(Packet::PubAck { packet_id, reason_code })
        }
        PUBREC => {
            let (packet_id, reason_code) = decode_ack_with_reason(body, version)?;
            Ok(Packet::PubRec { packet_id, reason_code })
        }
        PUBREL => {
            if flags != 0x02 {
                return Err(Error::protocol("pubrel with non-reserved flags"));
            }
            let (packet_id, reason_code) = decode_ack_with_reason(body, version)?;
            Ok(Packet::PubRel { packet_id, reason_code })
        }
        PUBCOMP => {
            let (packet_id, reason_code) = decode_ack_with_reason(body, version)?;
            Ok(Packet::PubComp { packet_id, reason_code })
        }
        SUBSCRIBE => {
            if flags != 0x02 {
                return Err(Error::protocol("subscribe with non-reserved flags"));
            }
            decode_subscribe(body, version)
        }
        SUBACK => decode_suback(body, version),
        UNSUBSCRIBE => {
            if flags != 0x02 {
                return Err(Error::protocol("unsubscribe with non-reserved flags"));
            }
            decode_unsubscribe(body, version)
        }
        UNSUBACK => decode_unsuback(body, version),
        PINGREQ => Ok(Packet::PingReq),
        PINGRESP => Ok(Packet::PingResp),
        DISCONNECT => decode_disconnect(body),
        AUTH if version == ProtocolVersion::V5 => decode_auth(body),
        other => Err(Error::protocol(format!("unsupported mqtt packet type {other}"))),
    }
}

/// Streaming decoder (§4.8): `feed` appends bytes, `poll` extracts as many
/// complete packets as are available. Once `poll` returns `Err`, the parser
/// is latched in the error state until `reset` (§8 property 10).
pub struct Parser {
    buf: BytesMut,
    version: ProtocolVersion,
    max_packet_size: usize,
    errored: bool,
}

impl Parser {
    pub fn new(version: ProtocolVersion, max_packet_size: usize) -> Self {
        Self { buf: BytesMut::new(), version, max_packet_size, errored: false }
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.errored = false;
    }

    /// Pulls the next complete packet, if the buffer holds one. `Ok(None)`
    /// means "need more bytes"; it never consumes partial data.
    pub fn poll(&mut self) -> Result<Option<Packet>> {
        if self.errored {
            return Err(Error::protocol("mqtt parser is in the error state; call reset()"));
        }
        match self.try_decode() {
            Ok(Some((packet, consumed))) => {
                self.buf.advance(consumed);
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.errored = true;
                Err(e)
            }
        }
    }

    fn try_decode(&self) -> Result<Option<(Packet, usize)>> {
        let buf: &[u8] = &self.buf;
        if buf.is_empty() {
            return Ok(None);
        }
        let type_and_flags = buf[0];
        let (remaining_len, len_bytes) = match decode_remaining_length(&buf[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        if remaining_len > self.max_packet_size {
            return Err(Error::protocol(format!(
                "mqtt packet of {remaining_len} bytes exceeds configured max_payload of {}",
                self.max_packet_size
            )));
        }
        let header_len = 1 + len_bytes;
        let total = header_len + remaining_len;
        if buf.len() < total {
            return Ok(None);
        }
        let packet = decode_packet(type_and_flags, &buf[header_len..total], self.version)?;
        Ok(Some((packet, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_round_trips_at_boundary_values() {
        let cases: &[(usize, usize)] = &[
            (0, 1),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (2097151, 3),
            (2097152, 4),
            (268435455, 4),
        ];
        for &(n, expected_len) in cases {
            let encoded = encode_remaining_length(n).unwrap();
            assert_eq!(encoded.len(), expected_len, "length mismatch for {n}");
            let (decoded, consumed) = decode_remaining_length(&encoded).unwrap().unwrap();
            assert_eq!(decoded, n);
            assert_eq!(consumed, expected_len);
        }
    }

    #[test]
    fn remaining_length_over_ceiling_rejected() {
        assert!(encode_remaining_length(MAX_REMAINING_LENGTH + 1).is_err());
    }

    #[test]
    fn parser_resyncs_after_malformed_packet() {
        let mut parser = Parser::new(ProtocolVersion::V311, 1024);
        // SUBSCRIBE with a non-reserved flags nibble is malformed.
        parser.feed(&[0x80, 0x00]);
        assert!(parser.poll().is_err());
        assert!(parser.is_errored());
        assert!(parser.poll().is_err());
        parser.reset();
        assert!(!parser.is_errored());
    }

    #[test]
    fn parser_handles_pingreq_split_across_feeds() {
        let mut parser = Parser::new(ProtocolVersion::V311, 1024);
        parser.feed(&[0xC0]);
        assert!(parser.poll().unwrap().is_none());
        parser.feed(&[0x00]);
        assert!(matches!(parser.poll().unwrap(), Some(Packet::PingReq)));
    }

    #[test]
    fn connack_with_unknown_v5_property_is_skipped() {
        // CONNACK: ack flags=0, reason=0, properties: [len=5][unknown id 0x02][4-byte blob]
        let mut body = vec![0x00, 0x00, 0x05, 0x02, 0xAA, 0xBB, 0xCC, 0xDD];
        let mut packet = vec![0x20u8];
        packet.extend(encode_remaining_length(body.len()).unwrap());
        packet.append(&mut body);

        let mut parser = Parser::new(ProtocolVersion::V5, 1024);
        parser.feed(&packet);
        let decoded = parser.poll().unwrap().unwrap();
        match decoded {
            Packet::ConnAck(ack) => assert!(ack.accepted()),
            _ => panic!("expected connack"),
        }
    }

    #[test]
    fn connack_extracts_session_expiry_and_receive_maximum() {
        let mut props = vec![0x11u8];
        props.extend_from_slice(&300u32.to_be_bytes());
        props.push(0x21);
        props.extend_from_slice(&50u16.to_be_bytes());

        let mut body = vec![0x01, 0x00];
        body.extend(encode_remaining_length(props.len()).unwrap());
        body.extend(props);

        let mut packet = vec![0x20u8];
        packet.extend(encode_remaining_length(body.len()).unwrap());
        packet.extend(body);

        let mut parser = Parser::new(ProtocolVersion::V5, 1024);
        parser.feed(&packet);
        let Packet::ConnAck(ack) = parser.poll().unwrap().unwrap() else { panic!("expected connack") };
        assert!(ack.session_present);
        assert_eq!(ack.properties.session_expiry_interval, Some(300));
        assert_eq!(ack.properties.receive_maximum, Some(50));
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut parser = Parser::new(ProtocolVersion::V311, 8);
        let mut packet = vec![0x30u8];
        packet.extend(encode_remaining_length(100).unwrap());
        packet.extend(vec![0u8; 100]);
        parser.feed(&packet);
        assert!(parser.poll().is_err());
    }
}
