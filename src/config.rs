use std::collections::HashMap;

use hyper::client::HttpConnector;

use crate::packet::BinaryType;
use crate::transport::TransportKind;

/// HTTP client shared by the polling transports, the Rust rendering of the
/// source's `agent` passthrough.
pub type HttpClient = hyper::Client<HttpConnector>;

/// Configuration for a [`Socket`](crate::Socket).
///
/// Build one with [`SocketConfig::builder`]:
/// ```
/// use engineio_client::SocketConfig;
///
/// let config = SocketConfig::builder()
///     .host("example.com")
///     .port(8080)
///     .path("/engine.io")
///     .build();
/// assert_eq!(config.path, "/engine.io/");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SocketConfig {
    /// Endpoint host.
    pub hostname: String,
    /// Endpoint port. Defaults to 80/443 according to `secure`.
    pub port: Option<u16>,
    /// Use TLS schemes (`https`/`wss`).
    pub secure: bool,
    /// Base path, normalised to end with `/`.
    pub path: String,
    /// Initial query map, merged into every transport URI.
    pub query: HashMap<String, String>,
    /// Enable upgrade probes once the session is open.
    pub upgrade: bool,
    /// Start directly on websocket when the previous session in this
    /// process upgraded successfully.
    pub remember_upgrade: bool,
    /// Ordered transport candidates.
    pub transports: Vec<TransportKind>,
    /// Force the JSONP polling variant.
    pub force_jsonp: bool,
    /// Disable binary framing, all packets travel as (base64) text.
    pub force_base64: bool,
    /// Reject upgrades to transports that cannot carry binary.
    pub only_binary_upgrades: bool,
    /// Name of the cache-busting timestamp query parameter.
    pub timestamp_param: String,
    /// Inject the timestamp parameter into every request URI.
    pub timestamp_requests: bool,
    /// Shared HTTP client used by the polling transports.
    pub agent: Option<HttpClient>,
    /// Requested representation for inbound binary packets.
    pub binary_type: BinaryType,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            port: None,
            secure: false,
            path: "/engine.io/".to_owned(),
            query: HashMap::new(),
            upgrade: true,
            remember_upgrade: false,
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            force_jsonp: false,
            force_base64: false,
            only_binary_upgrades: false,
            timestamp_param: "t".to_owned(),
            timestamp_requests: false,
            agent: None,
            binary_type: BinaryType::default(),
        }
    }
}

impl SocketConfig {
    pub fn builder() -> SocketConfigBuilder {
        SocketConfigBuilder::new()
    }

    /// The configured port, or the scheme default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SocketConfigBuilder {
    config: SocketConfig,
}

impl SocketConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SocketConfig::default(),
        }
    }

    /// Endpoint host. `hostname` is an alias.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.hostname = host.into();
        self
    }

    pub fn hostname(self, hostname: impl Into<String>) -> Self {
        self.host(hostname)
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.config.secure = secure;
        self
    }

    /// Base path. A trailing `/` is appended when missing.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        self.config.path = path;
        self
    }

    /// Adds a query parameter sent with every request.
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.insert(key.into(), value.into());
        self
    }

    pub fn query(mut self, query: HashMap<String, String>) -> Self {
        self.config.query = query;
        self
    }

    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.config.upgrade = upgrade;
        self
    }

    pub fn remember_upgrade(mut self, remember_upgrade: bool) -> Self {
        self.config.remember_upgrade = remember_upgrade;
        self
    }

    /// Ordered transport candidates. The first entry opens the session.
    pub fn transports(mut self, transports: impl Into<Vec<TransportKind>>) -> Self {
        self.config.transports = transports.into();
        self
    }

    pub fn force_jsonp(mut self, force_jsonp: bool) -> Self {
        self.config.force_jsonp = force_jsonp;
        self
    }

    pub fn force_base64(mut self, force_base64: bool) -> Self {
        self.config.force_base64 = force_base64;
        self
    }

    pub fn only_binary_upgrades(mut self, only_binary_upgrades: bool) -> Self {
        self.config.only_binary_upgrades = only_binary_upgrades;
        self
    }

    pub fn timestamp_param(mut self, param: impl Into<String>) -> Self {
        self.config.timestamp_param = param.into();
        self
    }

    pub fn timestamp_requests(mut self, timestamp_requests: bool) -> Self {
        self.config.timestamp_requests = timestamp_requests;
        self
    }

    /// Shared HTTP client used by the polling transports.
    pub fn agent(mut self, agent: HttpClient) -> Self {
        self.config.agent = Some(agent);
        self
    }

    pub fn binary_type(mut self, binary_type: BinaryType) -> Self {
        self.config.binary_type = binary_type;
        self
    }

    pub fn build(self) -> SocketConfig {
        self.config
    }
}
