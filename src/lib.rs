//! An Engine.IO client for tokio.
//!
//! The entry point is [`Socket::open`], which spawns the session task and
//! hands back a command handle plus an [`EventStream`]. The session opens
//! on the first configured transport (HTTP long-polling by default),
//! performs the Engine.IO handshake, keeps the connection alive with
//! ping/pong heartbeats, and — when the server offers it — upgrades to
//! websocket in-flight without dropping buffered messages.
//!
//! ```no_run
//! use engineio_client::{Event, Socket, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SocketConfig::builder()
//!         .host("localhost")
//!         .port(3000)
//!         .build();
//!     let (socket, mut events) = Socket::open(config);
//!     socket.send("hello").unwrap();
//!     while let Some(event) = events.recv().await {
//!         if let Event::Message(data) = event {
//!             println!("peer says {data:?}");
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod errors;
pub mod packet;
pub mod parser;
pub mod socket;
pub mod transport;

pub use config::{SocketConfig, SocketConfigBuilder};
pub use errors::{CloseReason, Error};
pub use packet::{BinaryType, Handshake, MessageData, Packet};
pub use socket::{
    prior_websocket_success, reset_prior_websocket_success, Event, EventStream, FlushAck, Socket,
};
pub use transport::TransportKind;

/// Engine.IO protocol revision spoken by this client, sent as `EIO=` in
/// every request.
pub const PROTOCOL_VERSION: u8 = 3;
