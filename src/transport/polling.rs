//! The polling transport: a GET long-poll loop paired with batched POST
//! writes, and the pause protocol the websocket upgrade relies on.
//!
//! The poll cycle is not self-recursing: after `PollComplete` the session
//! issues the next [`TransportCmd::Poll`], which guarantees that query
//! updates learned from the same batch (the handshake `sid`) are applied
//! before the next request goes out.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{Future, OptionFuture};
use http::{header, Request, StatusCode};
use hyper::Body;
use tokio::sync::mpsc;

use super::{
    EventSender, TransportCmd, TransportEvent, TransportKind, TransportOpts, TransportState,
    TransportToken,
};
use crate::config::HttpClient;
use crate::errors::Error;
use crate::packet::Packet;
use crate::parser;

/// The HTTP request layer behind the polling transport.
///
/// Kept as a seam so tests can substitute a scripted peer; the default
/// implementation rides the shared hyper client.
#[async_trait]
pub(crate) trait PollingClient: Send + Sync {
    async fn get(&self, uri: &str) -> Result<Bytes, Error>;
    async fn post(&self, uri: &str, body: Bytes) -> Result<(), Error>;
}

pub(crate) struct XhrClient {
    client: HttpClient,
}

impl XhrClient {
    fn new(agent: Option<HttpClient>) -> Self {
        Self {
            client: agent.unwrap_or_else(HttpClient::new),
        }
    }
}

#[async_trait]
impl PollingClient for XhrClient {
    async fn get(&self, uri: &str) -> Result<Bytes, Error> {
        let req = Request::get(uri).body(Body::empty())?;
        let res = self.client.request(req).await?;
        if res.status() != StatusCode::OK {
            return Err(Error::transport(format!(
                "request returned with status code {}",
                res.status().as_u16()
            )));
        }
        Ok(hyper::body::to_bytes(res.into_body()).await?)
    }

    async fn post(&self, uri: &str, body: Bytes) -> Result<(), Error> {
        let req = Request::post(uri)
            // important for binary requests
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))?;
        let res = self.client.request(req).await?;
        if res.status() != StatusCode::OK {
            return Err(Error::transport(format!(
                "request returned with status code {}",
                res.status().as_u16()
            )));
        }
        hyper::body::to_bytes(res.into_body()).await?;
        Ok(())
    }
}

type IoFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

enum Step {
    Cmd(Option<TransportCmd>),
    PollDone(Result<Bytes, Error>),
    WriteDone(Result<(), Error>),
}

pub(crate) struct PollingTransport {
    opts: TransportOpts,
    client: Arc<dyn PollingClient>,
    events: EventSender,
    token: TransportToken,
    state: TransportState,
    polling: bool,
    writable: bool,
    close_deferred: bool,
}

impl PollingTransport {
    pub(crate) fn new(opts: TransportOpts, events: EventSender, token: TransportToken) -> Self {
        let client = Arc::new(XhrClient::new(opts.agent.clone()));
        Self::with_client(opts, client, events, token)
    }

    fn with_client(
        opts: TransportOpts,
        client: Arc<dyn PollingClient>,
        events: EventSender,
        token: TransportToken,
    ) -> Self {
        Self {
            opts,
            client,
            events,
            token,
            state: TransportState::Init,
            polling: false,
            writable: false,
            close_deferred: false,
        }
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<TransportCmd>) {
        let mut poll_fut: Option<IoFuture<Result<Bytes, Error>>> = None;
        let mut write_fut: Option<IoFuture<Result<(), Error>>> = None;

        loop {
            let step = tokio::select! {
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                Some(res) = OptionFuture::from(poll_fut.as_mut()) => Step::PollDone(res),
                Some(res) = OptionFuture::from(write_fut.as_mut()) => Step::WriteDone(res),
            };
            match step {
                Step::Cmd(Some(TransportCmd::Open)) => {
                    if matches!(self.state, TransportState::Init | TransportState::Closed) {
                        self.state = TransportState::Opening;
                        self.start_poll(&mut poll_fut);
                    }
                }
                Step::Cmd(Some(TransportCmd::Poll)) => {
                    // ignored unless open, so a pause or close in between wins
                    if self.state == TransportState::Open && !self.polling {
                        self.start_poll(&mut poll_fut);
                    }
                }
                Step::Cmd(Some(TransportCmd::Send(packets))) => {
                    self.start_write(packets, &mut write_fut);
                }
                Step::Cmd(Some(TransportCmd::SetSid(sid))) => {
                    self.opts.query.insert("sid".to_owned(), sid);
                }
                Step::Cmd(Some(TransportCmd::Pause)) => {
                    if matches!(self.state, TransportState::Opening | TransportState::Open) {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("pausing polling transport");
                        self.state = TransportState::Pausing;
                        self.maybe_complete_pause();
                    }
                }
                Step::Cmd(Some(TransportCmd::Resume)) => {
                    if matches!(self.state, TransportState::Pausing | TransportState::Paused) {
                        self.state = TransportState::Open;
                        if !self.polling {
                            self.start_poll(&mut poll_fut);
                        }
                    }
                }
                Step::Cmd(Some(TransportCmd::Close)) => match self.state {
                    TransportState::Open => {
                        self.write_close_packet();
                        self.on_close();
                    }
                    TransportState::Opening => {
                        // closing while the handshake poll is in flight,
                        // defer the close packet until the transport opens
                        self.close_deferred = true;
                    }
                    _ => self.on_close(),
                },
                Step::Cmd(None) => self.on_close(),
                Step::PollDone(res) => {
                    poll_fut = None;
                    self.on_poll_response(res);
                }
                Step::WriteDone(res) => {
                    write_fut = None;
                    self.on_write_complete(res);
                }
            }
            if self.state == TransportState::Closed {
                break;
            }
        }
    }

    fn start_poll(&mut self, poll_fut: &mut Option<IoFuture<Result<Bytes, Error>>>) {
        #[cfg(feature = "tracing")]
        tracing::debug!("polling");
        self.polling = true;
        let client = self.client.clone();
        let uri = self.opts.uri(TransportKind::Polling);
        *poll_fut = Some(Box::pin(async move { client.get(&uri).await }));
        self.emit(TransportEvent::Poll);
    }

    fn start_write(&mut self, packets: Vec<Packet>, write_fut: &mut Option<IoFuture<Result<(), Error>>>) {
        if self.state != TransportState::Open {
            self.emit(TransportEvent::Error(Error::TransportNotOpen));
            return;
        }
        self.writable = false;
        match parser::encode_payload(&packets, self.opts.supports_binary) {
            Ok(body) => {
                let client = self.client.clone();
                let uri = self.opts.uri(TransportKind::Polling);
                *write_fut = Some(Box::pin(async move { client.post(&uri, body).await }));
            }
            Err(err) => self.emit(TransportEvent::Error(err)),
        }
    }

    fn on_poll_response(&mut self, res: Result<Bytes, Error>) {
        let data = match res {
            Ok(data) => data,
            Err(err) => return self.emit(TransportEvent::Error(err)),
        };
        #[cfg(feature = "tracing")]
        tracing::debug!("polling got data: {:?}", data);

        let binary_type = self.opts.binary_type;
        parser::decode_payload(&data, binary_type, |packet, _index, _total| {
            // the first decoded packet opens the transport
            if self.state == TransportState::Opening {
                self.on_open();
            }
            if packet == Packet::Close {
                self.on_close();
                return false;
            }
            self.emit(TransportEvent::Packet(packet));
            true
        });

        if self.state != TransportState::Closed {
            self.polling = false;
            self.emit(TransportEvent::PollComplete);
            self.maybe_complete_pause();
        }
    }

    fn on_write_complete(&mut self, res: Result<(), Error>) {
        match res {
            Ok(()) => {
                self.writable = true;
                self.emit(TransportEvent::Drain);
                self.maybe_complete_pause();
            }
            Err(err) => self.emit(TransportEvent::Error(err)),
        }
    }

    /// Pause completes once no poll is in flight and no POST is pending,
    /// whichever order those resolve in.
    fn maybe_complete_pause(&mut self) {
        if self.state == TransportState::Pausing && !self.polling && self.writable {
            #[cfg(feature = "tracing")]
            tracing::debug!("polling transport paused");
            self.state = TransportState::Paused;
            self.emit(TransportEvent::Paused);
        }
    }

    fn on_open(&mut self) {
        self.state = TransportState::Open;
        self.writable = true;
        self.emit(TransportEvent::Open);
        if self.close_deferred {
            self.write_close_packet();
            self.on_close();
        }
    }

    fn on_close(&mut self) {
        self.state = TransportState::Closed;
        self.emit(TransportEvent::Close);
    }

    /// Best-effort `close` packet, fired without waiting for the response.
    fn write_close_packet(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("writing close packet");
        if let Ok(body) = parser::encode_payload(&[Packet::Close], self.opts.supports_binary) {
            let client = self.client.clone();
            let uri = self.opts.uri(TransportKind::Polling);
            tokio::spawn(async move {
                let _ = client.post(&uri, body).await;
            });
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send((self.token, event));
    }
}
