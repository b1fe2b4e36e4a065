//! A scripted Engine.IO peer for the integration tests: just enough of the
//! server side of the protocol to drive handshakes, long-poll cycles,
//! heartbeats and websocket upgrades from a test body.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::header;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use engineio_client::packet::{BinaryType, Packet};
use engineio_client::parser;
use engineio_client::{Event, EventStream, SocketConfig, SocketConfigBuilder};

pub const SID: &str = "abc";

/// How the scripted peer behaves.
pub struct ServerOptions {
    /// `upgrades` advertised in the handshake.
    pub upgrades: Vec<&'static str>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    /// Payload echoed back to a `2probe` ping, `probe` for a well-behaved
    /// peer.
    pub probe_reply: &'static str,
    /// Answer bare pings with pongs on whatever transport they arrive on.
    pub auto_pong: bool,
    /// Never answer the handshake request.
    pub stall_handshake: bool,
    /// Answer the handshake request with a 500.
    pub fail_handshake: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            upgrades: Vec::new(),
            ping_interval: 25_000,
            ping_timeout: 5_000,
            probe_reply: "probe",
            auto_pong: true,
            stall_handshake: false,
            fail_handshake: false,
        }
    }
}

/// A packet the peer received, tagged with the transport it came in on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Polling(Packet),
    Ws(Packet),
}

struct State {
    opts: ServerOptions,
    /// Batches queued for the next long-poll responses.
    poll_tx: mpsc::UnboundedSender<Vec<Packet>>,
    poll_rx: Mutex<mpsc::UnboundedReceiver<Vec<Packet>>>,
    /// Batches to push over the websocket once it is established.
    ws_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<Packet>>>>,
    received_tx: mpsc::UnboundedSender<Received>,
    polling_handshakes: AtomicUsize,
    /// A websocket probe is in progress: polls are answered with `noop`
    /// right away so the peer can finish pausing its polling transport.
    upgrading: AtomicBool,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<State>,
    ws_tx: mpsc::UnboundedSender<Vec<Packet>>,
    pub received: mpsc::UnboundedReceiver<Received>,
}

impl TestServer {
    pub async fn spawn(opts: ServerOptions) -> Self {
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let (received_tx, received) = mpsc::unbounded_channel();
        let state = Arc::new(State {
            opts,
            poll_tx,
            poll_rx: Mutex::new(poll_rx),
            ws_rx: Mutex::new(Some(ws_rx)),
            received_tx,
            polling_handshakes: AtomicUsize::new(0),
            upgrading: AtomicBool::new(false),
        });

        let service_state = state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = service_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req)))
            }
        });
        let server = hyper::Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);

        Self {
            addr,
            state,
            ws_tx,
            received,
        }
    }

    /// Client configuration pointing at this peer.
    pub fn config(&self) -> SocketConfigBuilder {
        SocketConfig::builder()
            .host("127.0.0.1")
            .port(self.addr.port())
    }

    /// Queues a batch for the next long-poll response.
    pub fn push_polling(&self, packets: Vec<Packet>) {
        self.state.poll_tx.send(packets).unwrap();
    }

    /// Queues a batch to send over the websocket once it is up.
    pub fn push_ws(&self, packets: Vec<Packet>) {
        self.ws_tx.send(packets).unwrap();
    }

    pub fn polling_handshakes(&self) -> usize {
        self.state.polling_handshakes.load(Ordering::SeqCst)
    }

    /// Waits for the next received packet, whatever transport it used.
    pub async fn recv(&mut self) -> Received {
        self.received.recv().await.expect("server gone")
    }
}

async fn handle(state: Arc<State>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.headers().contains_key(header::UPGRADE) {
        return Ok(ws_accept(state, req));
    }
    let query = req.uri().query().unwrap_or("").to_owned();
    match *req.method() {
        Method::GET if !query.contains("sid=") => {
            state.polling_handshakes.fetch_add(1, Ordering::SeqCst);
            if state.opts.stall_handshake {
                futures::future::pending::<()>().await;
            }
            if state.opts.fail_handshake {
                let res = Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap();
                return Ok(res);
            }
            let upgrades = state
                .opts
                .upgrades
                .iter()
                .map(|u| format!("\"{u}\""))
                .collect::<Vec<_>>()
                .join(",");
            let handshake = format!(
                "{{\"sid\":\"{SID}\",\"upgrades\":[{upgrades}],\"pingInterval\":{},\"pingTimeout\":{}}}",
                state.opts.ping_interval, state.opts.ping_timeout
            );
            let payload = parser::encode_payload(&[Packet::Open(handshake)], false).unwrap();
            Ok(Response::new(Body::from(payload)))
        }
        Method::GET => {
            // long poll: parked until the test queues a batch, except while
            // a websocket probe is pending
            let packets = if state.upgrading.load(Ordering::SeqCst) {
                vec![Packet::Noop]
            } else {
                state
                    .poll_rx
                    .lock()
                    .await
                    .recv()
                    .await
                    .unwrap_or_else(|| vec![Packet::Noop])
            };
            let payload = parser::encode_payload(&packets, false).unwrap();
            Ok(Response::new(Body::from(payload)))
        }
        Method::POST => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            parser::decode_payload(&body, BinaryType::Bytes, |packet, _, _| {
                if state.opts.auto_pong && packet == Packet::Ping(None) {
                    let _ = state.poll_tx.send(vec![Packet::Pong(None)]);
                }
                let _ = state.received_tx.send(Received::Polling(packet));
                true
            });
            Ok(Response::new(Body::from("ok")))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap()),
    }
}

fn ws_accept(state: Arc<State>, req: Request<Body>) -> Response<Body> {
    let key = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => key.clone(),
        None => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Body::empty())
                .unwrap()
        }
    };
    let upgrading_session = req
        .uri()
        .query()
        .unwrap_or("")
        .contains("sid=");

    tokio::spawn(async move {
        if let Ok(upgraded) = hyper::upgrade::on(req).await {
            ws_session(state, upgraded, upgrading_session).await;
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(
            header::SEC_WEBSOCKET_ACCEPT,
            derive_accept_key(key.as_bytes()),
        )
        .body(Body::empty())
        .unwrap()
}

async fn ws_session(state: Arc<State>, upgraded: Upgraded, upgrading_session: bool) {
    let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let (mut sink, mut stream) = ws.split();

    if upgrading_session {
        // probe phase: expect `2probe`, reply, and release the polling
        // request that is parked at the peer with a noop
        match stream.next().await {
            Some(Ok(Message::Text(text))) if text == "2probe" => {
                if state.opts.probe_reply == "probe" {
                    state.upgrading.store(true, Ordering::SeqCst);
                }
                let _ = state.poll_tx.send(vec![Packet::Noop]);
                let reply = format!("3{}", state.opts.probe_reply);
                if sink.send(Message::Text(reply)).await.is_err() {
                    return;
                }
            }
            _ => return,
        }
    } else {
        // fresh websocket session: the handshake goes over the socket
        let handshake = format!(
            "{{\"sid\":\"{SID}\",\"upgrades\":[],\"pingInterval\":{},\"pingTimeout\":{}}}",
            state.opts.ping_interval, state.opts.ping_timeout
        );
        let open = parser::encode_packet(&Packet::Open(handshake), true).unwrap();
        let frame = match open {
            parser::RawData::Text(text) => Message::Text(text),
            parser::RawData::Binary(data) => Message::Binary(data.to_vec()),
        };
        if sink.send(frame).await.is_err() {
            return;
        }
    }

    let mut outgoing = state.ws_rx.lock().await.take();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let packet =
                        parser::decode_packet(parser::RawData::Text(text), BinaryType::Bytes);
                    if state.opts.auto_pong && packet == Packet::Ping(None) {
                        let _ = sink.send(Message::Text("3".to_owned())).await;
                    }
                    let _ = state.received_tx.send(Received::Ws(packet));
                }
                Some(Ok(Message::Binary(data))) => {
                    let packet = parser::decode_packet(
                        parser::RawData::Binary(data.into()),
                        BinaryType::Bytes,
                    );
                    let _ = state.received_tx.send(Received::Ws(packet));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            batch = recv_batch(&mut outgoing) => {
                for packet in batch {
                    let frame = match parser::encode_packet(&packet, true).unwrap() {
                        parser::RawData::Text(text) => Message::Text(text),
                        parser::RawData::Binary(data) => Message::Binary(data.to_vec()),
                    };
                    if sink.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Skips events until `pred` matches, failing the test after five seconds.
pub async fn wait_for<F>(events: &mut EventStream, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => {}
                None => panic!("event stream ended early"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn recv_batch(rx: &mut Option<mpsc::UnboundedReceiver<Vec<Packet>>>) -> Vec<Packet> {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(batch) => batch,
            None => futures::future::pending().await,
        },
        None => futures::future::pending().await,
    }
}
