//! HTTP/1.1 transport over measured connections.
//!
//! # Responsibilities
//! - Dial `http` and `https` origins through the measuring `Dialer`
//! - Keep idle connections per scheme, host and port, and reuse them
//! - When the request carries a `Trace`, report connection readiness and
//!   install `WireHooks` on the stream for the request's duration
//! - Tag responses with the `ConnId` that carried them
//!
//! # Design Decisions
//! - One request in flight per connection; a connection goes back to the
//!   pool as soon as its response headers arrive and is reused once hyper
//!   reports it ready again
//! - A `Context` in the request extensions bounds the dial and the wait for
//!   response headers, otherwise the configured dial timeout does
//! - Hooks sit above TLS so they only see application bytes

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::header::{HeaderValue, HOST};
use http::uri::Uri;
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::Service;

use super::hooks::{HookSlot, HookedBody, HookedStream, RequestHead, WireHooks};
use super::{header_list, HttpBody, HttpError, RoundTrip, Trace};
use crate::config::NetxConfig;
use crate::context::Context;
use crate::measurement::{ConnId, HttpConnectionReadyEvent, Measurement};
use crate::net::{join_host_port, Dialer, MeasuringConn, Network, TlsConn};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_IDLE_PER_HOST: usize = 4;

/// Plain or TLS stream under a pooled HTTP/1.1 connection.
enum HttpStream {
    Plain(MeasuringConn),
    Tls(TlsConn),
}

impl HttpStream {
    fn conn(&self) -> &MeasuringConn {
        match self {
            HttpStream::Plain(conn) => conn,
            HttpStream::Tls(tls) => tls.conn(),
        }
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    https: bool,
    host: String,
    port: u16,
}

impl PoolKey {
    fn from_uri(uri: &Uri) -> Result<Self, HttpError> {
        let invalid = |reason| HttpError::InvalidUri {
            uri: uri.to_string(),
            reason,
        };
        let https = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(_) => return Err(invalid("unsupported scheme")),
            None => return Err(invalid("missing scheme")),
        };
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Self { https, host, port })
    }

    fn default_port(&self) -> u16 {
        if self.https {
            443
        } else {
            80
        }
    }

    fn host_header(&self) -> String {
        if self.port == self.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            join_host_port(&self.host, self.port)
        }
    }
}

/// What the transport remembers about a connection.
#[derive(Clone)]
struct ConnInfo {
    id: ConnId,
    network: Network,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    hooks: HookSlot,
}

impl ConnInfo {
    fn of(stream: &HookedStream<HttpStream>) -> Self {
        let conn = stream.get_ref().conn();
        Self {
            id: conn.id(),
            network: conn.network(),
            local_addr: conn.local_addr(),
            peer_addr: conn.peer_addr(),
            hooks: stream.slot(),
        }
    }
}

struct PooledConn {
    sender: http1::SendRequest<HttpBody>,
    info: ConnInfo,
}

#[derive(Default)]
struct Pool {
    idle: Mutex<HashMap<PoolKey, Vec<PooledConn>>>,
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, HashMap<PoolKey, Vec<PooledConn>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a ready connection, discarding closed ones.
    fn checkout(&self, key: &PoolKey) -> Option<PooledConn> {
        let mut idle = self.lock();
        let list = idle.get_mut(key)?;
        let mut busy = Vec::new();
        let mut found = None;
        while let Some(conn) = list.pop() {
            if conn.sender.is_closed() {
                continue;
            }
            if conn.sender.is_ready() {
                found = Some(conn);
                break;
            }
            busy.push(conn);
        }
        list.extend(busy);
        found
    }

    fn checkin(&self, key: PoolKey, conn: PooledConn, max_idle: usize) {
        if conn.sender.is_closed() {
            return;
        }
        let mut idle = self.lock();
        let list = idle.entry(key).or_default();
        list.retain(|c| !c.sender.is_closed());
        if list.len() < max_idle {
            list.push(conn);
        }
    }

    fn idle_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

/// Pooled HTTP/1.1 client built on `Dialer`.
#[derive(Clone)]
pub struct HttpTransport {
    dialer: Dialer,
    pool: Arc<Pool>,
    dial_timeout: Duration,
    max_idle_per_host: usize,
}

impl HttpTransport {
    pub fn new(dialer: Dialer) -> Self {
        Self {
            dialer,
            pool: Arc::new(Pool::default()),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
        }
    }

    pub fn from_config(config: &NetxConfig, dialer: Dialer) -> Self {
        Self::new(dialer)
            .with_dial_timeout(Duration::from_millis(config.dialer.dial_timeout_ms))
            .with_max_idle_per_host(config.http.max_idle_per_host)
    }

    /// Zero keeps the default.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.dial_timeout = timeout;
        }
        self
    }

    /// Zero disables connection reuse.
    pub fn with_max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = max;
        self
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Connections currently idle in the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    async fn connect(&self, ctx: &Context, key: &PoolKey) -> Result<PooledConn, HttpError> {
        let address = join_host_port(&key.host, key.port);
        let stream = if key.https {
            HttpStream::Tls(self.dialer.dial_tls(ctx, "tcp", &address).await?)
        } else {
            HttpStream::Plain(self.dialer.dial_context(ctx, "tcp", &address).await?)
        };
        let stream = HookedStream::new(stream);
        let info = ConnInfo::of(&stream);
        let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        let conn_id = info.id;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(%conn_id, error = %e, "http connection closed with error");
            }
        });
        Ok(PooledConn { sender, info })
    }

    async fn execute(self, mut req: Request<HttpBody>) -> Result<Response<HttpBody>, HttpError> {
        let key = PoolKey::from_uri(req.uri())?;
        let trace = req.extensions().get::<Trace>().cloned();
        let ctx = req
            .extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_else(|| Context::with_timeout(self.dial_timeout));

        let (mut conn, reused) = match self.pool.checkout(&key) {
            Some(conn) => (conn, true),
            None => (self.connect(&ctx, &key).await?, false),
        };
        tracing::debug!(conn_id = %conn.info.id, reused, host = %key.host, "http connection ready");

        let url = req.uri().to_string();
        if !req.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(&key.host_header()).map_err(|_| HttpError::InvalidUri {
                uri: url.clone(),
                reason: "host is not a valid header value",
            })?;
            req.headers_mut().insert(HOST, host);
        }
        let path = req.uri().path_and_query().map_or("/", |p| p.as_str()).to_string();
        *req.uri_mut() = Uri::from_str(&path).map_err(|_| HttpError::InvalidUri {
            uri: url.clone(),
            reason: "invalid path",
        })?;

        let hooks = trace.map(|trace| {
            trace.emitter().emit(Measurement::HttpConnectionReady(HttpConnectionReadyEvent {
                transaction_id: trace.transaction_id(),
                conn_id: conn.info.id,
                network: conn.info.network.to_string(),
                local_address: conn.info.local_addr,
                remote_address: conn.info.peer_addr,
                reused,
                time: trace.emitter().now(),
            }));
            let head = RequestHead {
                method: req.method().to_string(),
                url,
                headers: header_list(req.headers()),
            };
            let body_finished = req.body().is_end_stream();
            let hooks = Arc::new(WireHooks::new(trace, conn.info.id, head, body_finished));
            conn.info.hooks.store(Some(hooks.clone()));
            hooks
        });
        if let Some(hooks) = &hooks {
            let hooks = hooks.clone();
            req = req.map(|body| HookedBody::new(body, hooks).boxed_unsync());
        }

        let sender = &mut conn.sender;
        let result = match ctx
            .run(async move {
                sender.ready().await?;
                sender.send_request(req).await
            })
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(HttpError::Hyper(e)),
            Err(e) => Err(HttpError::Interrupted(e)),
        };
        conn.info.hooks.store(None);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(conn_id = %conn.info.id, error = %e, "http round trip failed");
                if let Some(hooks) = &hooks {
                    hooks.on_error(&e.to_string());
                }
                return Err(e);
            }
        };
        if let Some(hooks) = &hooks {
            hooks.on_response();
        }

        let conn_id = conn.info.id;
        if self.max_idle_per_host > 0 {
            self.pool.checkin(key, conn, self.max_idle_per_host);
        }
        let (mut parts, body) = response.into_parts();
        parts.extensions.insert(conn_id);
        Ok(Response::from_parts(parts, body.map_err(Into::into).boxed_unsync()))
    }
}

impl Service<Request<HttpBody>> for HttpTransport {
    type Response = Response<HttpBody>;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<HttpBody>) -> Self::Future {
        Box::pin(self.clone().execute(req))
    }
}

impl RoundTrip for HttpTransport {
    fn round_trip(&self, req: Request<HttpBody>) -> BoxFuture<'static, Result<Response<HttpBody>, HttpError>> {
        Box::pin(self.clone().execute(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_defaults_ports() {
        let key = PoolKey::from_uri(&Uri::from_static("https://example.com/a?b")).unwrap();
        assert_eq!((key.https, key.host.as_str(), key.port), (true, "example.com", 443));
        assert_eq!(key.host_header(), "example.com");

        let key = PoolKey::from_uri(&Uri::from_static("http://[::1]:8080/")).unwrap();
        assert_eq!(key.host, "::1");
        assert_eq!(key.host_header(), "[::1]:8080");
    }

    #[test]
    fn pool_key_rejects_bad_uris() {
        assert!(matches!(
            PoolKey::from_uri(&Uri::from_static("/relative")),
            Err(HttpError::InvalidUri { reason: "missing scheme", .. })
        ));
        assert!(matches!(
            PoolKey::from_uri(&Uri::from_static("ftp://example.com/")),
            Err(HttpError::InvalidUri { reason: "unsupported scheme", .. })
        ));
    }
}
