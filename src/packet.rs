use bytes::Bytes;
use serde::Deserialize;

/// An Engine.IO packet.
///
/// `Ping`/`Pong` carry an optional payload: the upgrade probe uses
/// `ping("probe")`/`pong("probe")`, the heartbeat uses bare packets.
/// `Error` is only ever produced by the decoder (a malformed packet decodes
/// to `Error("parser error")`) or received from the peer; it cannot be
/// encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Handshake packet, its data is the JSON-encoded [`Handshake`].
    Open(String),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(String),
    Binary(Bytes),
    Upgrade,
    Noop,
    Error(String),
}

impl Packet {
    /// Wire index of the packet type.
    pub(crate) fn index(&self) -> Option<char> {
        match self {
            Packet::Open(_) => Some('0'),
            Packet::Close => Some('1'),
            Packet::Ping(_) => Some('2'),
            Packet::Pong(_) => Some('3'),
            Packet::Message(_) | Packet::Binary(_) => Some('4'),
            Packet::Upgrade => Some('5'),
            Packet::Noop => Some('6'),
            Packet::Error(_) => None,
        }
    }
}

/// Data of the `open` packet sent by the server upon connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    pub upgrades: Vec<String>,
    /// Interval between client pings, in milliseconds.
    pub ping_interval: u64,
    /// Grace period for the matching pong, in milliseconds.
    pub ping_timeout: u64,
}

/// Payload of a `message` packet, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    Text(String),
    Binary(Bytes),
}

impl From<&str> for MessageData {
    fn from(s: &str) -> Self {
        MessageData::Text(s.to_owned())
    }
}
impl From<String> for MessageData {
    fn from(s: String) -> Self {
        MessageData::Text(s)
    }
}
impl From<Bytes> for MessageData {
    fn from(b: Bytes) -> Self {
        MessageData::Binary(b)
    }
}
impl From<Vec<u8>> for MessageData {
    fn from(b: Vec<u8>) -> Self {
        MessageData::Binary(b.into())
    }
}

impl From<MessageData> for Packet {
    fn from(data: MessageData) -> Self {
        match data {
            MessageData::Text(s) => Packet::Message(s),
            MessageData::Binary(b) => Packet::Binary(b),
        }
    }
}

/// Requested representation for inbound binary packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryType {
    /// Surface binary packets as [`Bytes`].
    #[default]
    Bytes,
    /// Pass binary packets through as the base64 text the wire carried.
    Base64Text,
}
