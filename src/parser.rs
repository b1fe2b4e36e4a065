//! Engine.IO V3 packet and payload codec.
//!
//! Single packets are encoded as `<type index><data>` text frames, or for
//! binary-capable transports as raw frames whose first byte is the type
//! index. Payloads batch several packets for the polling transport:
//! `<char count>:<packet>` in text mode, `<is binary><length digits>0xFF`
//! framing in binary mode. Malformed input never fails the caller, it
//! decodes to an `error` packet exactly like the reference parser.

use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::Error;
use crate::packet::{BinaryType, Packet};

const PARSER_ERROR: &str = "parser error";

/// One encoded unit, ready for (or read from) the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawData {
    Text(String),
    Binary(Bytes),
}

/// Encodes a single packet for a websocket frame.
///
/// Binary data is framed as a raw binary unit when the transport supports
/// it, and base64-encoded behind a `b` marker otherwise.
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> Result<RawData, Error> {
    let index = packet
        .index()
        .ok_or(Error::Parser("cannot encode an error packet"))?;
    match packet {
        Packet::Binary(data) if supports_binary => {
            let mut buf = BytesMut::with_capacity(data.len() + 1);
            buf.put_u8(index as u8 - b'0');
            buf.extend_from_slice(data);
            Ok(RawData::Binary(buf.freeze()))
        }
        Packet::Binary(data) => Ok(RawData::Text(format!("b{}{}", index, b64.encode(data)))),
        _ => Ok(RawData::Text(match text_body(packet) {
            Some(body) => format!("{index}{body}"),
            None => index.to_string(),
        })),
    }
}

/// Decodes a single packet from a websocket frame.
pub fn decode_packet(raw: RawData, binary_type: BinaryType) -> Packet {
    match raw {
        RawData::Text(s) => decode_text(&s, binary_type),
        RawData::Binary(data) => {
            if data.is_empty() {
                return Packet::Error(PARSER_ERROR.to_owned());
            }
            let body = data.slice(1..);
            from_binary_parts(data[0], body, binary_type)
        }
    }
}

/// Encodes a batch of packets as a single polling payload.
pub fn encode_payload(packets: &[Packet], supports_binary: bool) -> Result<Bytes, Error> {
    if packets.is_empty() {
        return Ok(Bytes::from_static(b"0:"));
    }
    let has_binary = packets.iter().any(|p| matches!(p, Packet::Binary(_)));
    if supports_binary && has_binary {
        encode_binary_payload(packets)
    } else {
        let mut out = String::new();
        for packet in packets {
            match encode_packet(packet, false)? {
                RawData::Text(s) => {
                    out.push_str(&s.chars().count().to_string());
                    out.push(':');
                    out.push_str(&s);
                }
                RawData::Binary(_) => unreachable!("text encoding yields text frames"),
            }
        }
        Ok(Bytes::from(out))
    }
}

/// Decodes a polling payload, invoking `cb` with `(packet, index, total)`
/// per decoded packet. The callback returns `false` to stop the iteration.
///
/// A malformed payload yields a single `error` packet.
pub fn decode_payload<F>(data: &[u8], binary_type: BinaryType, mut cb: F)
where
    F: FnMut(Packet, usize, usize) -> bool,
{
    let packets = match data.first() {
        Some(0x00) | Some(0x01) => decode_binary_payload(data, binary_type),
        _ => decode_text_payload(data, binary_type),
    };
    let packets = match packets {
        Some(packets) => packets,
        None => vec![Packet::Error(PARSER_ERROR.to_owned())],
    };
    let total = packets.len();
    for (i, packet) in packets.into_iter().enumerate() {
        if !cb(packet, i, total) {
            break;
        }
    }
}

fn text_body(packet: &Packet) -> Option<&str> {
    match packet {
        Packet::Open(data) | Packet::Message(data) => Some(data),
        Packet::Ping(data) | Packet::Pong(data) => data.as_deref(),
        _ => None,
    }
}

fn decode_text(s: &str, binary_type: BinaryType) -> Packet {
    let mut chars = s.chars();
    match chars.next() {
        Some('b') => {
            // base64 packet: `b<type index><base64 data>`
            let index = match chars.next() {
                Some(c @ '0'..='6') => c,
                _ => return Packet::Error(PARSER_ERROR.to_owned()),
            };
            match b64.decode(chars.as_str()) {
                Ok(data) => from_binary_parts(index as u8 - b'0', data.into(), binary_type),
                Err(_) => Packet::Error(PARSER_ERROR.to_owned()),
            }
        }
        Some(index @ '0'..='6') => from_text_parts(index, chars.as_str()),
        _ => Packet::Error(PARSER_ERROR.to_owned()),
    }
}

fn from_text_parts(index: char, body: &str) -> Packet {
    let opt = || (!body.is_empty()).then(|| body.to_owned());
    match index {
        '0' => Packet::Open(body.to_owned()),
        '1' => Packet::Close,
        '2' => Packet::Ping(opt()),
        '3' => Packet::Pong(opt()),
        '4' => Packet::Message(body.to_owned()),
        '5' => Packet::Upgrade,
        '6' => Packet::Noop,
        _ => Packet::Error(PARSER_ERROR.to_owned()),
    }
}

fn from_binary_parts(index: u8, body: Bytes, binary_type: BinaryType) -> Packet {
    match index {
        4 => match binary_type {
            BinaryType::Bytes => Packet::Binary(body),
            BinaryType::Base64Text => Packet::Message(b64.encode(&body)),
        },
        0..=6 => match String::from_utf8(body.to_vec()) {
            Ok(s) => from_text_parts((index + b'0') as char, &s),
            Err(_) => Packet::Error(PARSER_ERROR.to_owned()),
        },
        _ => Packet::Error(PARSER_ERROR.to_owned()),
    }
}

fn encode_binary_payload(packets: &[Packet]) -> Result<Bytes, Error> {
    let mut out = BytesMut::new();
    for packet in packets {
        let (is_binary, content, len) = match encode_packet(packet, true)? {
            RawData::Text(s) => {
                let len = s.chars().count();
                (0u8, Bytes::from(s), len)
            }
            RawData::Binary(b) => {
                let len = b.len();
                (1u8, b, len)
            }
        };
        out.put_u8(is_binary);
        for digit in len.to_string().bytes() {
            out.put_u8(digit - b'0');
        }
        out.put_u8(0xFF);
        out.extend_from_slice(&content);
    }
    Ok(out.freeze())
}

fn decode_text_payload(data: &[u8], binary_type: BinaryType) -> Option<Vec<Packet>> {
    let s = std::str::from_utf8(data).ok()?;
    // an empty batch encodes as `0:`
    if s.is_empty() || s == "0:" {
        return Some(Vec::new());
    }
    let mut packets = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let colon = rest.find(':')?;
        let count: usize = rest[..colon].parse().ok()?;
        let body = &rest[colon + 1..];
        let byte_len = utf8_prefix_len(body.as_bytes(), count)?;
        packets.push(decode_text(&body[..byte_len], binary_type));
        rest = &body[byte_len..];
    }
    Some(packets)
}

fn decode_binary_payload(data: &[u8], binary_type: BinaryType) -> Option<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let is_binary = match rest[0] {
            0x00 => false,
            0x01 => true,
            _ => return None,
        };
        let sep = memchr::memchr(0xFF, &rest[1..])?;
        let mut len = 0usize;
        for &digit in &rest[1..1 + sep] {
            if digit > 9 {
                return None;
            }
            len = len.checked_mul(10)?.checked_add(digit as usize)?;
        }
        let content = &rest[1 + sep + 1..];
        let byte_len = if is_binary {
            (len <= content.len()).then_some(len)?
        } else {
            utf8_prefix_len(content, len)?
        };
        let raw = if is_binary {
            // the leading type byte is part of the content
            RawData::Binary(Bytes::copy_from_slice(&content[..byte_len]))
        } else {
            RawData::Text(std::str::from_utf8(&content[..byte_len]).ok()?.to_owned())
        };
        packets.push(decode_packet(raw, binary_type));
        rest = &content[byte_len..];
    }
    Some(packets)
}

/// Byte length of the first `nchars` characters of a UTF-8 prefix.
fn utf8_prefix_len(bytes: &[u8], nchars: usize) -> Option<usize> {
    let mut i = 0;
    for _ in 0..nchars {
        let lead = *bytes.get(i)?;
        let width = match lead {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return None,
        };
        i += width;
    }
    (i <= bytes.len()).then_some(i)
}
