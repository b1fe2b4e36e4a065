//! The session: lifecycle, packet dispatch, heartbeat timers, the buffered
//! write pipeline, and upgrade orchestration.
//!
//! All session state lives in one task. Transports report in through a
//! shared event channel, tagged with the token of the emitting instance;
//! swapping a transport amounts to changing which token the session
//! listens to, which is how "remove all listeners" is rendered here.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration, Sleep};

use crate::config::SocketConfig;
use crate::errors::{CloseReason, Error};
use crate::packet::{Handshake, MessageData, Packet};
use crate::transport::{
    self, EventSender, TransportEvent, TransportHandle, TransportKind, TransportOpts,
    TransportToken,
};
use crate::PROTOCOL_VERSION;

/// Did the most recently opened session in this process end up on
/// websocket? Guides the `remember_upgrade` fast path.
static PRIOR_WEBSOCKET_SUCCESS: AtomicBool = AtomicBool::new(false);

/// Reads the process-wide websocket success flag.
pub fn prior_websocket_success() -> bool {
    PRIOR_WEBSOCKET_SUCCESS.load(Ordering::Relaxed)
}

/// Clears the process-wide websocket success flag.
///
/// Sessions share this flag across the whole process; tests that exercise
/// `remember_upgrade` reset it so they do not inherit state from sessions
/// opened elsewhere.
pub fn reset_prior_websocket_success() {
    PRIOR_WEBSOCKET_SUCCESS.store(false, Ordering::Relaxed);
}

fn set_prior_websocket_success(value: bool) {
    PRIOR_WEBSOCKET_SUCCESS.store(value, Ordering::Relaxed);
}

/// Events emitted by a [`Socket`], delivered on its [`EventStream`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// The session is open, buffered packets are being flushed.
    Open,
    /// The server handshake, emitted just before [`Event::Open`].
    Handshake(Handshake),
    /// Any decoded packet, before type dispatch.
    Packet(Packet),
    /// A packet was appended to the write buffer.
    PacketCreate(Packet),
    /// A `message` packet payload.
    Data(MessageData),
    /// Same payload as [`Event::Data`].
    Message(MessageData),
    /// A packet arrived, the liveness deadline was pushed back.
    Heartbeat,
    /// A ping was flushed to the peer.
    Ping,
    /// The peer answered a ping.
    Pong,
    /// A batch was handed to the transport.
    Flush,
    /// The write buffer is empty.
    Drain,
    /// A probe succeeded, the transport swap is in progress.
    Upgrading(TransportKind),
    /// The transport swap completed.
    Upgrade(TransportKind),
    /// A probe failed. The current transport is unaffected.
    UpgradeError(Error),
    Error(Error),
    Close {
        reason: CloseReason,
        description: Option<String>,
    },
}

/// Receiving half of a session: the stream of [`Event`]s.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Waits for the next event. `None` once the session task is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

/// Resolves when the packet it was created for has been flushed to the
/// peer, or with [`Error::Closed`] when the session discarded it.
#[derive(Debug)]
pub struct FlushAck(oneshot::Receiver<()>);

impl Future for FlushAck {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Closed))
    }
}

enum Command {
    Send {
        data: MessageData,
        ack: Option<oneshot::Sender<()>>,
    },
    Close,
}

/// A handle on one Engine.IO session.
///
/// ```no_run
/// use engineio_client::{Socket, SocketConfig};
///
/// # async fn run() {
/// let config = SocketConfig::builder().host("localhost").port(3000).build();
/// let (socket, mut events) = Socket::open(config);
/// socket.send("hello").unwrap();
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Socket {
    /// Opens a session and returns the handle plus its event stream.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(config: SocketConfig) -> (Socket, EventStream) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Session::new(config, event_tx);
        tokio::spawn(session.run(cmd_rx));
        (Socket { cmd_tx }, EventStream { rx: event_rx })
    }

    /// Queues a message. Buffered until the session is open and the
    /// transport is writable; delivery order follows submission order.
    pub fn send(&self, data: impl Into<MessageData>) -> Result<(), Error> {
        self.cmd_tx
            .send(Command::Send {
                data: data.into(),
                ack: None,
            })
            .map_err(|_| Error::Closed)
    }

    /// Like [`send`](Socket::send), and returns a [`FlushAck`] resolving
    /// once the message has been flushed to the peer.
    pub fn send_with_ack(&self, data: impl Into<MessageData>) -> Result<FlushAck, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                data: data.into(),
                ack: Some(tx),
            })
            .map_err(|_| Error::Closed)?;
        Ok(FlushAck(rx))
    }

    /// Closes the session. The event stream ends with
    /// `Close { reason: ForcedClose, .. }`.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

type WriteCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Init,
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeStage {
    /// Probe transport created, waiting for it to open.
    Started,
    /// Probe ping sent, waiting for the matching pong.
    Opened,
    /// Pong received, the current transport is pausing.
    Pinged,
}

struct Probe {
    token: TransportToken,
    kind: TransportKind,
    handle: TransportHandle,
    stage: ProbeStage,
}

enum Step {
    Transport(TransportToken, TransportEvent),
    Cmd(Option<Command>),
    Interval,
    Timeout,
}

struct Session {
    config: SocketConfig,
    ready_state: ReadyState,
    sid: Option<String>,
    upgrades: Vec<TransportKind>,
    ping_interval: Duration,
    ping_timeout: Duration,
    upgrading: bool,
    heartbeat_armed: bool,
    transport: Option<TransportHandle>,
    probes: Vec<Probe>,
    write_buffer: VecDeque<Packet>,
    callback_buffer: VecDeque<Option<WriteCallback>>,
    prev_buffer_len: usize,
    ping_interval_timer: Option<Pin<Box<Sleep>>>,
    ping_timeout_timer: Option<Pin<Box<Sleep>>>,
    events: mpsc::UnboundedSender<Event>,
    transport_tx: EventSender,
    transport_rx: mpsc::UnboundedReceiver<(TransportToken, TransportEvent)>,
    next_token: u64,
}

impl Session {
    fn new(config: SocketConfig, events: mpsc::UnboundedSender<Event>) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            config,
            ready_state: ReadyState::Init,
            sid: None,
            upgrades: Vec::new(),
            ping_interval: Duration::ZERO,
            ping_timeout: Duration::ZERO,
            upgrading: false,
            heartbeat_armed: false,
            transport: None,
            probes: Vec::new(),
            write_buffer: VecDeque::new(),
            callback_buffer: VecDeque::new(),
            prev_buffer_len: 0,
            ping_interval_timer: None,
            ping_timeout_timer: None,
            events,
            transport_tx,
            transport_rx,
            next_token: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        self.open();
        while self.ready_state != ReadyState::Closed {
            let step = tokio::select! {
                biased;
                Some((token, event)) = self.transport_rx.recv() => Step::Transport(token, event),
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                _ = armed(&mut self.ping_interval_timer) => Step::Interval,
                _ = armed(&mut self.ping_timeout_timer) => Step::Timeout,
            };
            match step {
                Step::Transport(token, event) => self.on_transport_event(token, event),
                Step::Cmd(Some(Command::Send { data, ack })) => {
                    let cb = ack.map(|tx| {
                        Box::new(move || {
                            let _ = tx.send(());
                        }) as WriteCallback
                    });
                    self.send_packet(Packet::from(data), cb);
                }
                Step::Cmd(Some(Command::Close)) | Step::Cmd(None) => {
                    self.on_close(CloseReason::ForcedClose, None);
                }
                Step::Interval => {
                    self.ping_interval_timer = None;
                    self.ping();
                    let timeout = self.ping_timeout;
                    self.on_heartbeat(Some(timeout));
                }
                Step::Timeout => {
                    self.ping_timeout_timer = None;
                    self.on_close(CloseReason::PingTimeout, None);
                }
            }
        }
    }

    /// Selects the initial transport and starts opening.
    fn open(&mut self) {
        let kind = if self.config.remember_upgrade
            && prior_websocket_success()
            && self.config.transports.contains(&TransportKind::Websocket)
        {
            TransportKind::Websocket
        } else {
            match self.config.transports.first() {
                Some(kind) => *kind,
                None => {
                    self.ready_state = ReadyState::Opening;
                    self.on_error(Error::transport("no transports configured"));
                    return;
                }
            }
        };
        let kind = if kind == TransportKind::Polling && self.config.force_jsonp {
            TransportKind::PollingJsonp
        } else {
            kind
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("opening session with transport {}", kind);
        self.ready_state = ReadyState::Opening;
        match self.create_transport(kind) {
            Ok(handle) => {
                handle.open();
                self.transport = Some(handle);
            }
            Err(err) => self.on_error(err),
        }
    }

    fn create_transport(&mut self, kind: TransportKind) -> Result<TransportHandle, Error> {
        let mut query = self.config.query.clone();
        query.insert("EIO".to_owned(), PROTOCOL_VERSION.to_string());
        query.insert("transport".to_owned(), kind.name().to_owned());
        if let Some(sid) = &self.sid {
            query.insert("sid".to_owned(), sid.clone());
        }
        let opts = TransportOpts {
            hostname: self.config.hostname.clone(),
            port: self.config.effective_port(),
            secure: self.config.secure,
            path: self.config.path.clone(),
            query,
            timestamp_param: self.config.timestamp_param.clone(),
            timestamp_requests: self.config.timestamp_requests,
            supports_binary: kind.supports_binary(self.config.force_base64),
            binary_type: self.config.binary_type,
            agent: self.config.agent.clone(),
        };
        self.next_token += 1;
        transport::create(
            kind,
            opts,
            self.transport_tx.clone(),
            TransportToken(self.next_token),
        )
    }

    fn on_transport_event(&mut self, token: TransportToken, event: TransportEvent) {
        if self.transport.as_ref().map_or(false, |t| t.token == token) {
            self.on_current_event(event);
        } else if let Some(idx) = self.probes.iter().position(|p| p.token == token) {
            self.on_probe_event(idx, event);
        }
        // anything else comes from a transport the session no longer
        // listens to
    }

    fn on_current_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if let Some(t) = self.transport.as_mut() {
                    t.writable = true;
                }
            }
            TransportEvent::Packet(packet) => self.on_packet(packet),
            TransportEvent::Drain => self.on_drain(),
            TransportEvent::Error(err) => self.on_error(err),
            TransportEvent::Close => self.on_close(CloseReason::TransportClose, None),
            TransportEvent::Poll => {}
            TransportEvent::PollComplete => {
                // continue the poll cycle; the transport ignores this when
                // it is pausing or closed
                if let Some(t) = &self.transport {
                    t.poll();
                }
            }
            TransportEvent::Paused => self.on_pause_complete(),
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        if !matches!(self.ready_state, ReadyState::Opening | ReadyState::Open) {
            #[cfg(feature = "tracing")]
            tracing::debug!("packet ignored, session is {:?}", self.ready_state);
            return;
        }
        self.emit(Event::Packet(packet.clone()));
        // any inbound packet counts as liveness
        self.emit(Event::Heartbeat);
        if self.heartbeat_armed {
            self.on_heartbeat(None);
        }
        match packet {
            Packet::Open(data) => match serde_json::from_str::<Handshake>(&data) {
                Ok(handshake) => self.on_handshake(handshake),
                Err(err) => self.on_error(err.into()),
            },
            Packet::Pong(_) => {
                self.set_ping();
                self.emit(Event::Pong);
            }
            Packet::Error(data) => self.emit(Event::Error(Error::Server(data))),
            Packet::Message(data) => {
                self.emit(Event::Data(MessageData::Text(data.clone())));
                self.emit(Event::Message(MessageData::Text(data)));
            }
            Packet::Binary(data) => {
                self.emit(Event::Data(MessageData::Binary(data.clone())));
                self.emit(Event::Message(MessageData::Binary(data)));
            }
            _ => {}
        }
    }

    fn on_handshake(&mut self, handshake: Handshake) {
        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={}] handshake received", handshake.sid);
        self.emit(Event::Handshake(handshake.clone()));
        self.sid = Some(handshake.sid.clone());
        if let Some(t) = &self.transport {
            t.set_sid(handshake.sid);
        }
        self.upgrades = self.filter_upgrades(&handshake.upgrades);
        self.ping_interval = Duration::from_millis(handshake.ping_interval);
        self.ping_timeout = Duration::from_millis(handshake.ping_timeout);
        self.on_open();
        if self.ready_state == ReadyState::Closed {
            return;
        }
        self.set_ping();
        self.heartbeat_armed = true;
    }

    fn on_open(&mut self) {
        self.ready_state = ReadyState::Open;
        let current = self.transport.as_ref().map(|t| t.kind);
        set_prior_websocket_success(current == Some(TransportKind::Websocket));
        self.emit(Event::Open);
        self.flush();
        // probes only make sense when the current transport has something
        // to pause
        if self.config.upgrade && current.map_or(false, |k| k.is_polling()) {
            for kind in self.upgrades.clone() {
                self.probe(kind);
            }
        }
    }

    /// Only upgrades the client was configured to use are probed.
    fn filter_upgrades(&self, upgrades: &[String]) -> Vec<TransportKind> {
        upgrades
            .iter()
            .filter_map(|u| u.parse::<TransportKind>().ok())
            .filter(|kind| self.config.transports.contains(kind))
            .collect()
    }

    // Heartbeat. The interval timer sends a ping and arms the timeout with
    // `ping_timeout` alone; a packet in any other situation re-arms it with
    // `ping_interval + ping_timeout`. The asymmetry is part of the
    // protocol.

    fn set_ping(&mut self) {
        self.ping_interval_timer = Some(Box::pin(sleep(self.ping_interval)));
    }

    fn ping(&mut self) {
        let events = self.events.clone();
        self.send_packet(
            Packet::Ping(None),
            Some(Box::new(move || {
                let _ = events.send(Event::Ping);
            })),
        );
    }

    fn on_heartbeat(&mut self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(self.ping_interval + self.ping_timeout);
        self.ping_timeout_timer = Some(Box::pin(sleep(timeout)));
    }

    // Write pipeline.

    fn send_packet(&mut self, packet: Packet, cb: Option<WriteCallback>) {
        if matches!(self.ready_state, ReadyState::Init | ReadyState::Closed) {
            return;
        }
        self.emit(Event::PacketCreate(packet.clone()));
        self.write_buffer.push_back(packet);
        self.callback_buffer.push_back(cb);
        self.flush();
    }

    fn flush(&mut self) {
        if self.ready_state == ReadyState::Closed
            || self.upgrading
            || self.write_buffer.is_empty()
        {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !transport.writable {
            return;
        }
        self.prev_buffer_len = self.write_buffer.len();
        let packets: Vec<Packet> = self.write_buffer.iter().cloned().collect();
        #[cfg(feature = "tracing")]
        tracing::debug!("flushing {} packets", packets.len());
        transport.send(packets);
        self.emit(Event::Flush);
    }

    fn on_drain(&mut self) {
        if let Some(t) = self.transport.as_mut() {
            t.writable = true;
        }
        debug_assert_eq!(self.write_buffer.len(), self.callback_buffer.len());
        for cb in self.callback_buffer.drain(..self.prev_buffer_len) {
            if let Some(cb) = cb {
                cb();
            }
        }
        self.write_buffer.drain(..self.prev_buffer_len);
        // an upgrade can swap transports between flush and drain, the next
        // flush must start from a clean in-flight count
        self.prev_buffer_len = 0;
        if self.write_buffer.is_empty() {
            self.emit(Event::Drain);
        } else {
            self.flush();
        }
    }

    // Upgrade probes.

    fn probe(&mut self, kind: TransportKind) {
        #[cfg(feature = "tracing")]
        tracing::debug!("probing transport {}", kind);
        if self.config.only_binary_upgrades
            && !kind.supports_binary(self.config.force_base64)
        {
            self.emit(Event::UpgradeError(Error::Probe));
            return;
        }
        match self.create_transport(kind) {
            Ok(handle) => {
                handle.open();
                self.probes.push(Probe {
                    token: handle.token,
                    kind,
                    handle,
                    stage: ProbeStage::Started,
                });
            }
            Err(err) => self.emit(Event::UpgradeError(err)),
        }
    }

    fn on_probe_event(&mut self, idx: usize, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                let probe = &mut self.probes[idx];
                probe.handle.writable = true;
                if probe.stage == ProbeStage::Started {
                    probe.stage = ProbeStage::Opened;
                    probe
                        .handle
                        .send(vec![Packet::Ping(Some("probe".to_owned()))]);
                }
            }
            TransportEvent::Packet(packet) => {
                if self.probes[idx].stage != ProbeStage::Opened {
                    return;
                }
                if packet == Packet::Pong(Some("probe".to_owned())) {
                    if self.upgrading {
                        // another candidate already won the race
                        self.fail_probe(idx, Error::Probe);
                        return;
                    }
                    let probe = &mut self.probes[idx];
                    probe.stage = ProbeStage::Pinged;
                    let kind = probe.kind;
                    #[cfg(feature = "tracing")]
                    tracing::debug!("probe {} succeeded, pausing current transport", kind);
                    self.upgrading = true;
                    self.emit(Event::Upgrading(kind));
                    set_prior_websocket_success(kind == TransportKind::Websocket);
                    if let Some(t) = &self.transport {
                        t.pause();
                    }
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("probe failed, unexpected packet {:?}", packet);
                    self.fail_probe(idx, Error::Probe);
                }
            }
            TransportEvent::Error(err) => self.fail_probe(idx, err),
            TransportEvent::Close => {
                self.fail_probe(idx, Error::transport("probe transport closed"));
            }
            TransportEvent::Drain => self.probes[idx].handle.writable = true,
            _ => {}
        }
    }

    fn fail_probe(&mut self, idx: usize, err: Error) {
        let probe = self.probes.remove(idx);
        probe.handle.close();
        if probe.stage == ProbeStage::Pinged {
            // the pause was already requested, resume normal writes
            self.upgrading = false;
            if let Some(t) = &self.transport {
                t.resume();
            }
            self.flush();
        }
        self.emit(Event::UpgradeError(err));
    }

    /// The current transport finished pausing: perform the swap.
    fn on_pause_complete(&mut self) {
        if self.ready_state == ReadyState::Closed || !self.upgrading {
            return;
        }
        let Some(idx) = self.probes.iter().position(|p| p.stage == ProbeStage::Pinged) else {
            // the winner died while the pause was in flight
            self.upgrading = false;
            if let Some(t) = &self.transport {
                t.resume();
            }
            self.flush();
            return;
        };
        let probe = self.probes.swap_remove(idx);
        // the race is decided, tear down the other candidates
        for other in std::mem::take(&mut self.probes) {
            other.handle.close();
            self.emit(Event::UpgradeError(Error::Probe));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("upgrading to {}", probe.kind);
        let kind = probe.kind;
        if let Some(old) = self.transport.replace(probe.handle) {
            old.close();
        }
        if let Some(t) = self.transport.as_mut() {
            t.send(vec![Packet::Upgrade]);
        }
        self.emit(Event::Upgrade(kind));
        self.upgrading = false;
        self.flush();
    }

    // Teardown.

    fn on_error(&mut self, err: Error) {
        #[cfg(feature = "tracing")]
        tracing::debug!("session error: {}", err);
        set_prior_websocket_success(false);
        let message = err.to_string();
        self.emit(Event::Error(err));
        self.on_close(CloseReason::TransportError(message), None);
    }

    fn on_close(&mut self, reason: CloseReason, description: Option<String>) {
        if !matches!(self.ready_state, ReadyState::Opening | ReadyState::Open) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("session closed: {}", reason);
        self.ping_interval_timer = None;
        self.ping_timeout_timer = None;
        self.heartbeat_armed = false;
        self.upgrading = false;
        // every transport, probes included, is closed on the way out
        for probe in std::mem::take(&mut self.probes) {
            probe.handle.close();
        }
        if let Some(t) = self.transport.take() {
            t.close();
        }
        self.ready_state = ReadyState::Closed;
        self.sid = None;
        self.emit(Event::Close {
            reason,
            description,
        });
        // buffers are cleared after the close event, pending acks resolve
        // as discarded
        self.write_buffer.clear();
        self.callback_buffer.clear();
        self.prev_buffer_len = 0;
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

async fn armed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
