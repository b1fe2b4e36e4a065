use std::fmt;

use tokio_tungstenite::tungstenite;

/// Error type for the whole crate.
///
/// Errors never cross component boundaries as panics: transports convert
/// them into `error` events and the session decides whether they are fatal.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("transport error: {message}")]
    Transport {
        message: String,
        description: Option<String>,
    },

    /// An `error` packet received from the peer. Not fatal by itself.
    #[error("server error: {0}")]
    Server(String),

    #[error("parser error: {0}")]
    Parser(&'static str),

    #[error("probe error")]
    Probe,

    #[error("transport is not open")]
    TransportNotOpen,

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("transport {0} is not available in this build")]
    UnsupportedTransport(&'static str),

    /// The session is closed; the command or ack was discarded.
    #[error("session is closed")]
    Closed,

    #[error("invalid handshake: {0}")]
    InvalidHandshake(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] http::Error),

    #[error("http client error: {0}")]
    HttpClient(#[from] hyper::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
}

impl Error {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            description: None,
        }
    }
}

/// Reason the session closed, carried by [`Event::Close`](crate::Event::Close).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CloseReason {
    /// The current transport closed underneath the session.
    TransportClose,
    /// The current transport reported a fatal error.
    TransportError(String),
    /// No packet was received within `ping_interval + ping_timeout`.
    PingTimeout,
    /// The user called [`Socket::close`](crate::Socket::close).
    ForcedClose,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TransportClose => f.write_str("transport close"),
            CloseReason::TransportError(msg) => write!(f, "transport error {msg}"),
            CloseReason::PingTimeout => f.write_str("ping timeout"),
            CloseReason::ForcedClose => f.write_str("forced close"),
        }
    }
}
