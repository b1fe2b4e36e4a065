//! The transport layer: the registry of transport kinds, the endpoint
//! options shared by every transport, URI construction, and the uniform
//! command/event surface the session drives transports through.
//!
//! Each transport runs as its own task. It consumes [`TransportCmd`]s from
//! the session and reports back `(token, TransportEvent)` pairs; the token
//! identifies the transport instance so the session can discard events from
//! a transport it no longer listens to.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::sync::mpsc;

use crate::config::HttpClient;
use crate::errors::Error;
use crate::packet::{BinaryType, Packet};

pub(crate) mod polling;
pub(crate) mod ws;

/// The transport names recognised by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling (the XHR variant).
    Polling,
    /// JSONP long-polling. Recognised but provided by an external
    /// collaborator, not this crate.
    PollingJsonp,
    Websocket,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::PollingJsonp => "polling-jsonp",
            TransportKind::Websocket => "websocket",
        }
    }

    pub(crate) fn is_polling(&self) -> bool {
        matches!(self, TransportKind::Polling | TransportKind::PollingJsonp)
    }

    /// Whether a transport of this kind can carry raw binary frames.
    pub(crate) fn supports_binary(&self, force_base64: bool) -> bool {
        match self {
            TransportKind::PollingJsonp => false,
            _ => !force_base64,
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "polling" | "polling-xhr" => Ok(TransportKind::Polling),
            "polling-jsonp" => Ok(TransportKind::PollingJsonp),
            "websocket" => Ok(TransportKind::Websocket),
            _ => Err(Error::UnknownTransport(s.to_owned())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one transport instance for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransportToken(pub(crate) u64);

/// Events a transport reports to the session.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// The transport is open and writable.
    Open,
    Packet(Packet),
    /// The previous write batch has left the transport.
    Drain,
    Error(Error),
    /// The transport closed underneath the session.
    Close,
    /// Polling only: a poll request was issued.
    Poll,
    /// Polling only: the in-flight poll completed.
    PollComplete,
    /// A requested pause has completed.
    Paused,
}

/// Commands the session sends to a transport.
#[derive(Debug)]
pub(crate) enum TransportCmd {
    Open,
    Send(Vec<Packet>),
    /// Propagate the session id learned from the handshake into the
    /// transport query.
    SetSid(String),
    /// Polling only: start the next poll cycle.
    Poll,
    Pause,
    /// Undo a pause after an aborted upgrade.
    Resume,
    Close,
}

pub(crate) type EventSender = mpsc::UnboundedSender<(TransportToken, TransportEvent)>;

/// Lifecycle of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportState {
    Init,
    Opening,
    Open,
    Pausing,
    Paused,
    Closed,
}

/// Endpoint and policy options shared by every transport.
pub(crate) struct TransportOpts {
    pub hostname: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
    pub query: HashMap<String, String>,
    pub timestamp_param: String,
    pub timestamp_requests: bool,
    pub supports_binary: bool,
    pub binary_type: BinaryType,
    pub agent: Option<HttpClient>,
}

/// Characters kept verbatim in query components, every other byte is
/// percent-encoded.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

impl TransportOpts {
    /// Builds the request URI for one transport kind:
    /// `scheme://hostname[:port]/path?query`, the port omitted when it is
    /// the scheme default.
    pub(crate) fn uri(&self, kind: TransportKind) -> String {
        let scheme = match (kind, self.secure) {
            (TransportKind::Websocket, false) => "ws",
            (TransportKind::Websocket, true) => "wss",
            (_, false) => "http",
            (_, true) => "https",
        };

        let mut query = self.query.clone();
        if self.timestamp_requests {
            query.insert(self.timestamp_param.clone(), unix_seconds().to_string());
        }
        if !self.supports_binary {
            query.insert("b64".to_owned(), "1".to_owned());
        }

        let mut pairs: Vec<_> = query.iter().collect();
        pairs.sort_by_key(|(k, _)| k.as_str());
        let query = pairs
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, QUERY),
                    utf8_percent_encode(v, QUERY)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let default_port = if self.secure { 443 } else { 80 };
        let port = if self.port == default_port {
            String::new()
        } else {
            format!(":{}", self.port)
        };

        let sep = if query.is_empty() { "" } else { "?" };
        format!(
            "{scheme}://{}{port}{}{sep}{query}",
            self.hostname, self.path
        )
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Creates a transport of the given kind and spawns its task.
///
/// The JSONP variant is an external collaborator; asking for it here is an
/// error the caller surfaces through the usual event path.
pub(crate) fn create(
    kind: TransportKind,
    opts: TransportOpts,
    events: EventSender,
    token: TransportToken,
) -> Result<TransportHandle, Error> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    match kind {
        TransportKind::Polling => {
            let transport = polling::PollingTransport::new(opts, events, token);
            tokio::spawn(transport.run(cmd_rx));
        }
        TransportKind::Websocket => {
            let transport = ws::WebSocketTransport::new(opts, events, token);
            tokio::spawn(transport.run(cmd_rx));
        }
        TransportKind::PollingJsonp => {
            return Err(Error::UnsupportedTransport("polling-jsonp"));
        }
    }
    Ok(TransportHandle {
        kind,
        token,
        writable: false,
        cmd_tx,
    })
}

/// The session's handle on a live transport.
///
/// `writable` mirrors the transport's own flag: it is cleared whenever a
/// batch is dispatched and set again on `Open`/`Drain` events, so the
/// session can gate `flush` without asking the transport.
pub(crate) struct TransportHandle {
    pub kind: TransportKind,
    pub token: TransportToken,
    pub writable: bool,
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
}

impl TransportHandle {
    pub(crate) fn open(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Open);
    }

    pub(crate) fn send(&mut self, packets: Vec<Packet>) {
        self.writable = false;
        let _ = self.cmd_tx.send(TransportCmd::Send(packets));
    }

    pub(crate) fn set_sid(&self, sid: String) {
        let _ = self.cmd_tx.send(TransportCmd::SetSid(sid));
    }

    pub(crate) fn poll(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Poll);
    }

    pub(crate) fn pause(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Pause);
    }

    pub(crate) fn resume(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Resume);
    }

    pub(crate) fn close(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Close);
    }

    /// A handle wired to nothing but a command receiver, for unit tests of
    /// the session state machine.
    #[cfg(test)]
    pub(crate) fn stub(
        kind: TransportKind,
        token: TransportToken,
    ) -> (Self, mpsc::UnboundedReceiver<TransportCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                kind,
                token,
                writable: false,
                cmd_tx,
            },
            cmd_rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> TransportOpts {
        TransportOpts {
            hostname: "h".to_owned(),
            port: 80,
            secure: false,
            path: "/engine.io/".to_owned(),
            query: HashMap::from([
                ("EIO".to_owned(), "3".to_owned()),
                ("transport".to_owned(), "polling".to_owned()),
            ]),
            timestamp_param: "t".to_owned(),
            timestamp_requests: false,
            supports_binary: true,
            binary_type: BinaryType::Bytes,
            agent: None,
        }
    }

    #[test]
    fn kind_registry() {
        assert_eq!("polling".parse::<TransportKind>().unwrap(), TransportKind::Polling);
        assert_eq!(
            "polling-xhr".parse::<TransportKind>().unwrap(),
            TransportKind::Polling
        );
        assert_eq!(
            "polling-jsonp".parse::<TransportKind>().unwrap(),
            TransportKind::PollingJsonp
        );
        assert_eq!(
            "websocket".parse::<TransportKind>().unwrap(),
            TransportKind::Websocket
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn uri_omits_default_port() {
        assert_eq!(
            opts().uri(TransportKind::Polling),
            "http://h/engine.io/?EIO=3&transport=polling"
        );
    }

    #[test]
    fn uri_keeps_non_default_port() {
        let mut opts = opts();
        opts.port = 8080;
        assert_eq!(
            opts.uri(TransportKind::Polling),
            "http://h:8080/engine.io/?EIO=3&transport=polling"
        );
    }

    #[test]
    fn uri_websocket_scheme() {
        let mut opts = opts();
        opts.secure = true;
        opts.port = 443;
        assert!(opts
            .uri(TransportKind::Websocket)
            .starts_with("wss://h/engine.io/?"));
    }

    #[test]
    fn uri_injects_b64_when_binary_unsupported() {
        let mut opts = opts();
        opts.supports_binary = false;
        assert!(opts.uri(TransportKind::Polling).contains("b64=1"));
    }

    #[test]
    fn uri_injects_timestamp() {
        let mut opts = opts();
        opts.timestamp_requests = true;
        assert!(opts.uri(TransportKind::Polling).contains("t="));
    }

    #[test]
    fn uri_percent_encodes_query() {
        let mut opts = opts();
        opts.query.insert("token".to_owned(), "a b&c".to_owned());
        assert!(opts.uri(TransportKind::Polling).contains("token=a%20b%26c"));
    }
}
