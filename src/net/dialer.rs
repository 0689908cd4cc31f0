//! Dialer with measured resolution, per-attempt connect measurements and
//! geometric backoff between rounds.
//!
//! # Responsibilities
//! - Parse `network` and `host:port`, resolve names through the
//!   measuring resolver, then try every usable address in order
//! - Emit one Connect measurement per attempt, all sharing the dial's
//!   connection ID
//! - Retry failed rounds after a jittered sleep until the schedule is
//!   exhausted or the context is done
//!
//! # Design Decisions
//! - A dial ID and a connection ID are allocated once per dial
//! - Input errors return before anything is measured
//! - Resolution failures end the dial immediately, without retry
//! - The dialer sleeps after every failed round, including the last
//!   (an interrupted sleep still reports `Timeout`)

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::ClientConfig;

use super::addr::{split_host_port, AddrError, Network, UnknownNetwork};
use super::connection::{MeasuringConn, Socket};
use super::tls::{self, TlsConn, TlsError};
use crate::config::NetxConfig;
use crate::context::{Context, ContextError};
use crate::measurement::{ConnId, ConnectEvent, DialId, Emitter, Measurement};
use crate::resilience::BackoffPolicy;
use crate::resolver::{LookupHost, MeasuringResolver};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    UnsupportedNetwork(#[from] UnknownNetwork),
    #[error(transparent)]
    InvalidAddress(#[from] AddrError),
    #[error("resolve: {0}")]
    Resolve(#[source] io::Error),
    #[error("no {network} addresses for {host:?}")]
    NoAddresses { network: Network, host: String },
    #[error("connect {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("all {} connect attempts failed; first: {}", .0.len(), first_message(.0))]
    AllAttemptsFailed(Vec<DialError>),
    #[error("dial failed after {} rounds; last: {}", .0.len(), last_message(.0))]
    Exhausted(Vec<DialError>),
    #[error("dial interrupted: {}", last_message(.0))]
    Timeout(Vec<DialError>),
    #[error(transparent)]
    Context(#[from] ContextError),
}

fn first_message(errors: &[DialError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

fn last_message(errors: &[DialError]) -> String {
    errors.last().map(ToString::to_string).unwrap_or_default()
}

impl DialError {
    /// Aggregate attempt failures, unwrapping a lone error.
    fn all_attempts_failed(mut errors: Vec<DialError>) -> Self {
        if errors.len() == 1 {
            if let Some(only) = errors.pop() {
                return only;
            }
        }
        DialError::AllAttemptsFailed(errors)
    }

    /// Aggregate round failures, unwrapping a lone error.
    fn exhausted(mut errors: Vec<DialError>) -> Self {
        if errors.len() == 1 {
            if let Some(only) = errors.pop() {
                return only;
            }
        }
        DialError::Exhausted(errors)
    }

    /// True for an interrupted dial and for concrete timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            DialError::Timeout(_) | DialError::Context(_) => true,
            DialError::Resolve(e) | DialError::Connect { source: e, .. } => {
                e.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }

    /// Whether retrying the same operation may succeed. Aggregates never are.
    pub fn is_temporary(&self) -> bool {
        match self {
            DialError::Resolve(e) | DialError::Connect { source: e, .. } => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Underlying errors of an aggregate, empty otherwise.
    pub fn errors(&self) -> &[DialError] {
        match self {
            DialError::AllAttemptsFailed(errors)
            | DialError::Exhausted(errors)
            | DialError::Timeout(errors) => errors,
            _ => &[],
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, DialError::Connect { .. } | DialError::AllAttemptsFailed(_))
    }
}

/// Per-dial identity carried through resolution and connect.
struct Target<'a> {
    network: Network,
    host: &'a str,
    port: u16,
    dial_id: DialId,
    conn_id: ConnId,
}

#[derive(Clone)]
pub struct Dialer {
    emitter: Arc<Emitter>,
    resolver: MeasuringResolver,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    tls_server_name: Option<String>,
    alpn: Vec<String>,
    tls: Arc<OnceLock<Arc<ClientConfig>>>,
}

impl Dialer {
    /// A dialer using the system resolver and the default schedule.
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self {
            resolver: MeasuringResolver::system(emitter.clone()),
            emitter,
            backoff: BackoffPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: tls::DEFAULT_HANDSHAKE_TIMEOUT,
            tls_server_name: None,
            alpn: Vec::new(),
            tls: Arc::new(OnceLock::new()),
        }
    }

    /// Apply the `dialer`, `backoff` and `tls` sections.
    ///
    /// The resolver stays the system one; see `resolver::from_config`.
    pub fn from_config(config: &NetxConfig, emitter: Arc<Emitter>) -> Result<Self, TlsError> {
        let mut dialer = Self::new(emitter)
            .with_backoff(BackoffPolicy::from_config(&config.backoff))
            .with_connect_timeout(Duration::from_millis(config.dialer.connect_timeout_ms))
            .with_handshake_timeout(Duration::from_millis(config.tls.handshake_timeout_ms));
        dialer.tls_server_name = config.tls.server_name.clone();
        dialer.alpn = config.tls.alpn.clone();
        if let Some(path) = &config.tls.ca_bundle_path {
            let tls_config = tls::client_config(&config.tls.alpn, Some(path.as_path()))?;
            dialer = dialer.with_tls_config(tls_config);
        }
        Ok(dialer)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn LookupHost>) -> Self {
        self.resolver = MeasuringResolver::new(resolver, self.emitter.clone());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Zero keeps the default.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.connect_timeout = timeout;
        }
        self
    }

    /// Zero keeps the default.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.handshake_timeout = timeout;
        }
        self
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(config);
        self.tls = Arc::new(cell);
        self
    }

    /// Send SNI `name` regardless of the dialed host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn resolver(&self) -> &MeasuringResolver {
        &self.resolver
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn bytes_read(&self) -> u64 {
        self.emitter.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.emitter.bytes_written()
    }

    /// TLS client configuration, built from the web PKI roots on first use.
    pub fn tls_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        if let Some(config) = self.tls.get() {
            return Ok(config.clone());
        }
        let config = tls::client_config(&self.alpn, None)?;
        Ok(self.tls.get_or_init(|| config).clone())
    }

    /// Resolve `host` outside of any dial.
    pub async fn lookup_host(&self, ctx: &Context, host: &str) -> io::Result<Vec<IpAddr>> {
        self.resolver.resolve(ctx, host, DialId::NONE).await
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<MeasuringConn, DialError> {
        self.dial_context(&Context::new(), network, address).await
    }

    pub async fn dial_context(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<MeasuringConn, DialError> {
        let network: Network = network.parse()?;
        let (host, port) = split_host_port(address)?;
        let target = Target {
            network,
            host,
            port,
            dial_id: self.emitter.ids().next_dial(),
            conn_id: self.emitter.ids().next_conn(),
        };
        tracing::debug!(dial_id = %target.dial_id, conn_id = %target.conn_id, %network, address, "dial");

        let mut errors = Vec::new();
        for (round, mean) in self.backoff.means().into_iter().enumerate() {
            if let Some(err) = ctx.err() {
                errors.push(DialError::Context(err));
                return Err(DialError::Timeout(errors));
            }
            match self.dial_round(ctx, &target).await {
                Ok(conn) => return Ok(conn),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => errors.push(err),
            }
            let delay = self.backoff.jittered(mean);
            tracing::debug!(
                dial_id = %target.dial_id,
                round = round + 1,
                delay_ms = delay.as_millis() as u64,
                "dial round failed, backing off"
            );
            if let Err(err) = ctx.run(tokio::time::sleep(delay)).await {
                errors.push(DialError::Context(err));
                return Err(DialError::Timeout(errors));
            }
        }
        Err(DialError::exhausted(errors))
    }

    /// Dial TCP and run a TLS handshake on top.
    ///
    /// SNI is the configured server name, or the dialed host.
    pub async fn dial_tls(&self, ctx: &Context, network: &str, address: &str) -> Result<TlsConn, TlsError> {
        let (host, _) = split_host_port(address).map_err(DialError::from)?;
        let server_name = self.tls_server_name.clone().unwrap_or_else(|| host.to_string());
        let config = self.tls_config()?;
        let conn = self.dial_context(ctx, network, address).await?;
        tls::handshake(ctx, conn, config, &server_name, self.handshake_timeout).await
    }

    async fn dial_round(&self, ctx: &Context, target: &Target<'_>) -> Result<MeasuringConn, DialError> {
        let ips = match target.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self
                .resolver
                .resolve(ctx, target.host, target.dial_id)
                .await
                .map_err(DialError::Resolve)?,
        };
        let candidates: Vec<SocketAddr> = ips
            .into_iter()
            .filter(|ip| target.network.accepts(ip))
            .map(|ip| SocketAddr::new(ip, target.port))
            .collect();
        if candidates.is_empty() {
            return Err(DialError::NoAddresses {
                network: target.network,
                host: target.host.to_string(),
            });
        }

        let mut errors = Vec::new();
        for address in candidates {
            match self.connect(ctx, target, address).await {
                Ok(conn) => return Ok(conn),
                Err(err) => errors.push(err),
            }
        }
        Err(DialError::all_attempts_failed(errors))
    }

    async fn connect(&self, ctx: &Context, target: &Target<'_>, address: SocketAddr) -> Result<MeasuringConn, DialError> {
        let start = Instant::now();
        let attempt = tokio::time::timeout(self.connect_timeout, open_socket(target.network, address));
        let result = match ctx.run(attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            Err(err) => Err(err.into()),
        };
        let stop = Instant::now();

        let local_address = result.as_ref().ok().and_then(|s| s.local_addr().ok());
        match &result {
            Ok(_) => tracing::debug!(conn_id = %target.conn_id, %address, "connect done"),
            Err(e) => tracing::debug!(conn_id = %target.conn_id, %address, error = %e, "connect failed"),
        }
        self.emitter.emit(Measurement::Connect(ConnectEvent {
            dial_id: target.dial_id,
            conn_id: target.conn_id,
            network: target.network.to_string(),
            remote_address: address,
            local_address,
            duration: stop.duration_since(start),
            error: result.as_ref().err().map(ToString::to_string),
            time: self.emitter.since_beginning(stop),
        }));

        match result {
            Ok(socket) => Ok(MeasuringConn::from_socket(
                socket,
                target.conn_id,
                target.network,
                self.emitter.clone(),
            )),
            Err(source) => Err(DialError::Connect { address, source }),
        }
    }
}

async fn open_socket(network: Network, address: SocketAddr) -> io::Result<Socket> {
    if network.is_udp() {
        let local: SocketAddr = if address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(address).await?;
        Ok(Socket::Udp(socket))
    } else {
        Ok(Socket::Tcp(TcpStream::connect(address).await?))
    }
}
