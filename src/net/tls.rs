//! TLS client configuration and the measured handshake.
//!
//! # Responsibilities
//! - Build rustls client configs from web PKI roots or a PEM CA bundle
//! - Run the handshake over a `MeasuringConn` under a `Context` and a
//!   handshake timeout
//! - Report version, cipher suite, ALPN and peer certificates in one
//!   TlsHandshake measurement
//! - Expose the negotiated state on `TlsConn` for later layers
//!
//! # Design Decisions
//! - Exactly one TlsHandshake measurement per handshake, whatever the outcome
//! - On failure or timeout the measurement is emitted first, then the
//!   connection is dropped (which measures its Close)
//! - A zero timeout means the 10 second default

use std::fs::File;
use std::io::{self, BufReader};
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ClientConnection, RootCertStore};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use super::connection::{MeasuringConn, Socket};
use super::dialer::DialError;
use crate::context::{Context, ContextError};
use crate::measurement::{CertificateSummary, ConnId, Measurement, TlsHandshakeEvent, TlsState};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TlsError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("tls handshake: {0}")]
    Handshake(#[source] io::Error),
    #[error("tls handshake: {0}")]
    Timeout(#[from] ContextError),
    #[error("tls config: {0}")]
    Config(#[source] io::Error),
}

impl TlsError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TlsError::Timeout(_) => true,
            TlsError::Dial(e) => e.is_timeout(),
            TlsError::Handshake(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Build a client config trusting either the web PKI roots or, when
/// given, only the certificates in `ca_bundle`.
pub fn client_config(alpn: &[String], ca_bundle: Option<&Path>) -> Result<Arc<ClientConfig>, TlsError> {
    let roots = match ca_bundle {
        Some(path) => load_ca_bundle(path).map_err(TlsError::Config)?,
        None => RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        },
    };
    client_config_with_roots(alpn, roots)
}

pub fn client_config_with_roots(alpn: &[String], roots: RootCertStore) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(io::Error::new(io::ErrorKind::InvalidInput, e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

/// Load every PEM certificate in `path` into a fresh root store.
pub fn load_ca_bundle(path: &Path) -> io::Result<RootCertStore> {
    if !path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("CA bundle not found: {:?}", path),
        ));
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    if roots.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates in CA bundle {:?}", path),
        ));
    }
    Ok(roots)
}

/// Run a client handshake over `conn`, measuring it.
pub async fn handshake<S>(
    ctx: &Context,
    conn: MeasuringConn<S>,
    config: Arc<ClientConfig>,
    server_name: &str,
    timeout: Duration,
) -> Result<TlsConn<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = if timeout.is_zero() { DEFAULT_HANDSHAKE_TIMEOUT } else { timeout };
    let ctx = ctx.child_with_timeout(timeout);
    let emitter = conn.emitter().clone();
    let conn_id = conn.id();
    let next_protos: Vec<String> = config
        .alpn_protocols
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();
    let measure = |start: Instant, state: Option<TlsState>, error: Option<String>| {
        let stop = Instant::now();
        emitter.emit(Measurement::TlsHandshake(TlsHandshakeEvent {
            conn_id,
            server_name: server_name.to_string(),
            next_protos: next_protos.clone(),
            state,
            duration: stop.duration_since(start),
            error,
            time: emitter.since_beginning(stop),
        }));
    };

    let start = Instant::now();
    let name = match ServerName::try_from(server_name.to_string()) {
        Ok(name) => name,
        Err(_) => {
            let err = TlsError::InvalidServerName(server_name.to_string());
            measure(start, None, Some(err.to_string()));
            return Err(err);
        }
    };
    tracing::debug!(%conn_id, server_name, "tls handshake start");

    let mut connect = Box::pin(TlsConnector::from(config).connect(name, conn).into_fallible());
    let outcome = tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        out = &mut connect => Ok(out),
    };

    // Held until after the measurement so Close follows TlsHandshake.
    let mut leftover = None;
    let result = match outcome {
        Ok(Ok(stream)) => {
            let state = tls_state(stream.get_ref().1);
            log_state(conn_id, &state);
            measure(start, Some(state.clone()), None);
            return Ok(TlsConn { inner: stream, state });
        }
        Ok(Err((err, io))) => {
            leftover = Some(io);
            TlsError::Handshake(err)
        }
        Err(err) => TlsError::Timeout(err),
    };
    tracing::debug!(%conn_id, server_name, error = %result, "tls handshake failed");
    measure(start, None, Some(result.to_string()));
    drop(leftover);
    drop(connect);
    Err(result)
}

fn tls_state(conn: &ClientConnection) -> TlsState {
    TlsState {
        version: conn
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_default(),
        cipher_suite: conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default(),
        alpn: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
        peer_certificates: conn
            .peer_certificates()
            .map(|certs| certs.iter().filter_map(|c| summarize_certificate(c.as_ref())).collect())
            .unwrap_or_default(),
    }
}

fn log_state(conn_id: ConnId, state: &TlsState) {
    tracing::debug!(
        %conn_id,
        version = %state.version,
        cipher_suite = %state.cipher_suite,
        alpn = ?state.alpn,
        "tls handshake done"
    );
    for (depth, cert) in state.peer_certificates.iter().enumerate() {
        tracing::debug!(
            %conn_id,
            depth,
            subject = %cert.subject,
            issuer = %cert.issuer,
            not_before = cert.not_before,
            not_after = cert.not_after,
            dns_names = ?cert.dns_names,
            "peer certificate"
        );
    }
}

/// Summarize a DER certificate. Unparseable certificates yield `None`.
pub fn summarize_certificate(der: &[u8]) -> Option<CertificateSummary> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(raw) => ip_addresses.extend(ip_from_octets(raw)),
                _ => {}
            }
        }
    }
    Some(CertificateSummary {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        dns_names,
        ip_addresses,
    })
}

fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(raw) {
        return Some(IpAddr::from(v4));
    }
    <[u8; 16]>::try_from(raw).ok().map(IpAddr::from)
}

/// An established TLS session over a measured connection.
///
/// Reads and writes on the underlying connection are measured as
/// ciphertext.
#[derive(Debug)]
pub struct TlsConn<S = Socket> {
    inner: TlsStream<MeasuringConn<S>>,
    state: TlsState,
}

impl<S> TlsConn<S> {
    pub fn conn_id(&self) -> ConnId {
        self.inner.get_ref().0.id()
    }

    pub fn conn(&self) -> &MeasuringConn<S> {
        self.inner.get_ref().0
    }

    pub fn state(&self) -> &TlsState {
        &self.state
    }

    pub fn alpn(&self) -> Option<&str> {
        self.state.alpn.as_deref()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TlsConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TlsConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{BufferSink, Emitter};
    use crate::net::Network;

    #[test]
    fn summarizes_self_signed_certificate() {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        let summary = summarize_certificate(key.cert.der()).unwrap();
        assert_eq!(summary.dns_names, vec!["localhost".to_string()]);
        assert_eq!(summary.ip_addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert!(summary.not_before < summary.not_after);
        assert!(summarize_certificate(b"garbage").is_none());
    }

    #[test]
    fn missing_bundle_is_not_found() {
        let err = load_ca_bundle(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn alpn_is_configured() {
        let config = client_config(&["http/1.1".to_string()], None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn invalid_server_name_still_measured() {
        let sink = Arc::new(BufferSink::new());
        let emitter = Arc::new(Emitter::new(sink.clone()));
        let (a, _b) = tokio::io::duplex(64);
        let conn = MeasuringConn::new(a, ConnId::from_raw(9), Network::Tcp, emitter);
        let config = client_config(&[], None).unwrap();
        let err = handshake(&Context::new(), conn, config, "bad name!", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::InvalidServerName(_)));
        let kinds: Vec<_> = sink.pop_all().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["tls_handshake", "close"]);
    }

    #[tokio::test]
    async fn silent_peer_times_out_once() {
        let sink = Arc::new(BufferSink::new());
        let emitter = Arc::new(Emitter::new(sink.clone()));
        let (a, _b) = tokio::io::duplex(4096);
        let conn = MeasuringConn::new(a, ConnId::from_raw(2), Network::Tcp, emitter);
        let config = client_config(&[], None).unwrap();
        let err = handshake(&Context::new(), conn, config, "example.com", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let ms = sink.pop_all();
        let tls: Vec<_> = ms.iter().filter(|m| m.kind() == "tls_handshake").collect();
        assert_eq!(tls.len(), 1);
        assert!(tls[0].error().is_some());
        assert_eq!(ms.last().map(|m| m.kind()), Some("close"));
    }
}
