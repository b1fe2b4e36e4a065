//! The websocket transport: full duplex, one frame per packet, with a
//! synthetic `drain` after each flushed batch since framing backpressure is
//! left to the websocket library.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{
    EventSender, TransportCmd, TransportEvent, TransportKind, TransportOpts, TransportState,
    TransportToken,
};
use crate::errors::Error;
use crate::packet::Packet;
use crate::parser::{self, RawData};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

pub(crate) struct WebSocketTransport {
    opts: TransportOpts,
    events: EventSender,
    token: TransportToken,
    state: TransportState,
}

impl WebSocketTransport {
    pub(crate) fn new(opts: TransportOpts, events: EventSender, token: TransportToken) -> Self {
        Self {
            opts,
            events,
            token,
            state: TransportState::Init,
        }
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<TransportCmd>) {
        // nothing happens until the session opens the transport
        loop {
            match cmd_rx.recv().await {
                Some(TransportCmd::Open) => break,
                Some(TransportCmd::SetSid(sid)) => {
                    self.opts.query.insert("sid".to_owned(), sid);
                }
                Some(TransportCmd::Close) | None => {
                    self.on_close();
                    return;
                }
                Some(_) => {}
            }
        }

        self.state = TransportState::Opening;
        let uri = self.opts.uri(TransportKind::Websocket);
        #[cfg(feature = "tracing")]
        tracing::debug!("opening websocket to {}", uri);
        let ws = match connect_async(uri.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(err) => {
                self.emit(TransportEvent::Error(err.into()));
                return;
            }
        };
        self.state = TransportState::Open;
        self.emit(TransportEvent::Open);

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(data))) => self.on_data(RawData::Text(data)),
                    Some(Ok(Message::Binary(data))) => self.on_data(RawData::Binary(data.into())),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        self.on_close();
                        return;
                    }
                    Some(Err(err)) => {
                        self.emit(TransportEvent::Error(err.into()));
                        return;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(TransportCmd::Send(packets)) => {
                        if let Err(err) = self.write(&mut sink, packets).await {
                            self.emit(TransportEvent::Error(err));
                            return;
                        }
                    }
                    Some(TransportCmd::SetSid(sid)) => {
                        self.opts.query.insert("sid".to_owned(), sid);
                    }
                    // full duplex: nothing can be in flight, pause is immediate
                    Some(TransportCmd::Pause) => self.emit(TransportEvent::Paused),
                    Some(TransportCmd::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        self.on_close();
                        return;
                    }
                    Some(TransportCmd::Open)
                    | Some(TransportCmd::Poll)
                    | Some(TransportCmd::Resume) => {}
                },
            }
        }
    }

    /// Frames each packet individually, then reports one `drain` for the
    /// whole batch.
    async fn write(&self, sink: &mut WsSink, packets: Vec<Packet>) -> Result<(), Error> {
        if self.state != TransportState::Open {
            self.emit(TransportEvent::Error(Error::TransportNotOpen));
            return Ok(());
        }
        for packet in &packets {
            let frame = match parser::encode_packet(packet, self.opts.supports_binary)? {
                RawData::Text(data) => Message::Text(data),
                RawData::Binary(data) => Message::Binary(data.to_vec()),
            };
            sink.feed(frame).await?;
        }
        sink.flush().await?;
        self.emit(TransportEvent::Drain);
        Ok(())
    }

    fn on_data(&self, raw: RawData) {
        let packet = parser::decode_packet(raw, self.opts.binary_type);
        self.emit(TransportEvent::Packet(packet));
    }

    fn on_close(&mut self) {
        self.state = TransportState::Closed;
        self.emit(TransportEvent::Close);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send((self.token, event));
    }
}
