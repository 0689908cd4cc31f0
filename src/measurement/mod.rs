//! Measurement data model.
//!
//! # Data Flow
//! ```text
//! dialer / resolver / connection / tls / http tracer
//!     → Emitter (timestamps relative to Beginning, IDs, byte counters)
//!     → Sink (push callback or pull buffer)
//! ```
//!
//! # Design Decisions
//! - One enum variant per event kind; exactly one is populated per value
//! - Values are immutable once created; payloads are copied, never aliased
//! - Errors are captured as their display string so measurements stay `Clone`

pub mod emitter;
pub mod ids;
pub mod sink;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

pub use emitter::Emitter;
pub use ids::{ConnId, DialId, IdAllocator, IdKind, TransactionId};
pub use sink::{BufferSink, ChannelSink, NoopSink, Sink};

/// Header name/value pairs in the order they were observed.
pub type HeaderList = Vec<(String, String)>;

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// A host lookup.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveEvent {
    pub dial_id: DialId,
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

/// One connect attempt against a single address.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectEvent {
    pub dial_id: DialId,
    pub conn_id: ConnId,
    pub network: String,
    pub remote_address: SocketAddr,
    pub local_address: Option<SocketAddr>,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

/// A completed read or write on an instrumented connection.
#[derive(Debug, Clone, Serialize)]
pub struct IoEvent {
    pub conn_id: ConnId,
    pub num_bytes: u64,
    /// Datagram peer for `recv_from` / `send_to`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseEvent {
    pub conn_id: ConnId,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

/// What we learned about one peer certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    /// Unix timestamps of the validity window.
    pub not_before: i64,
    pub not_after: i64,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

/// Negotiated TLS parameters.
#[derive(Debug, Clone, Serialize)]
pub struct TlsState {
    pub version: String,
    pub cipher_suite: String,
    pub alpn: Option<String>,
    pub peer_certificates: Vec<CertificateSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsHandshakeEvent {
    pub conn_id: ConnId,
    pub server_name: String,
    pub next_protos: Vec<String>,
    /// Present only when the handshake succeeded.
    pub state: Option<TlsState>,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpConnectionReadyEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    pub network: String,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub reused: bool,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestHeadersDoneEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestDoneEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseStartEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseHeadersDoneEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    pub status: u16,
    pub headers: HeaderList,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseBodyPartEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    pub num_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseDoneEvent {
    pub transaction_id: TransactionId,
    pub conn_id: ConnId,
    pub error: Option<String>,
    #[serde(with = "secs")]
    pub time: Duration,
}

/// One timestamped record of a layer-level event.
#[derive(Debug, Clone, Serialize)]
pub enum Measurement {
    Resolve(ResolveEvent),
    Connect(ConnectEvent),
    Read(IoEvent),
    Write(IoEvent),
    Close(CloseEvent),
    TlsHandshake(TlsHandshakeEvent),
    HttpConnectionReady(HttpConnectionReadyEvent),
    HttpRequestHeadersDone(HttpRequestHeadersDoneEvent),
    HttpRequestDone(HttpRequestDoneEvent),
    HttpResponseStart(HttpResponseStartEvent),
    HttpResponseHeadersDone(HttpResponseHeadersDoneEvent),
    HttpResponseBodyPart(HttpResponseBodyPartEvent),
    HttpResponseDone(HttpResponseDoneEvent),
}

impl Measurement {
    /// Short name of the populated variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Measurement::Resolve(_) => "resolve",
            Measurement::Connect(_) => "connect",
            Measurement::Read(_) => "read",
            Measurement::Write(_) => "write",
            Measurement::Close(_) => "close",
            Measurement::TlsHandshake(_) => "tls_handshake",
            Measurement::HttpConnectionReady(_) => "http_connection_ready",
            Measurement::HttpRequestHeadersDone(_) => "http_request_headers_done",
            Measurement::HttpRequestDone(_) => "http_request_done",
            Measurement::HttpResponseStart(_) => "http_response_start",
            Measurement::HttpResponseHeadersDone(_) => "http_response_headers_done",
            Measurement::HttpResponseBodyPart(_) => "http_response_body_part",
            Measurement::HttpResponseDone(_) => "http_response_done",
        }
    }

    /// Elapsed time since the emitter's Beginning.
    pub fn time(&self) -> Duration {
        match self {
            Measurement::Resolve(e) => e.time,
            Measurement::Connect(e) => e.time,
            Measurement::Read(e) | Measurement::Write(e) => e.time,
            Measurement::Close(e) => e.time,
            Measurement::TlsHandshake(e) => e.time,
            Measurement::HttpConnectionReady(e) => e.time,
            Measurement::HttpRequestHeadersDone(e) => e.time,
            Measurement::HttpRequestDone(e) => e.time,
            Measurement::HttpResponseStart(e) => e.time,
            Measurement::HttpResponseHeadersDone(e) => e.time,
            Measurement::HttpResponseBodyPart(e) => e.time,
            Measurement::HttpResponseDone(e) => e.time,
        }
    }

    pub fn error(&self) -> Option<&str> {
        let error = match self {
            Measurement::Resolve(e) => &e.error,
            Measurement::Connect(e) => &e.error,
            Measurement::Read(e) | Measurement::Write(e) => &e.error,
            Measurement::Close(e) => &e.error,
            Measurement::TlsHandshake(e) => &e.error,
            Measurement::HttpRequestDone(e) => &e.error,
            Measurement::HttpResponseBodyPart(e) => &e.error,
            Measurement::HttpResponseDone(e) => &e.error,
            Measurement::HttpConnectionReady(_)
            | Measurement::HttpRequestHeadersDone(_)
            | Measurement::HttpResponseStart(_)
            | Measurement::HttpResponseHeadersDone(_) => return None,
        };
        error.as_deref()
    }

    pub fn dial_id(&self) -> DialId {
        match self {
            Measurement::Resolve(e) => e.dial_id,
            Measurement::Connect(e) => e.dial_id,
            _ => DialId::NONE,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        match self {
            Measurement::Resolve(_) => ConnId::NONE,
            Measurement::Connect(e) => e.conn_id,
            Measurement::Read(e) | Measurement::Write(e) => e.conn_id,
            Measurement::Close(e) => e.conn_id,
            Measurement::TlsHandshake(e) => e.conn_id,
            Measurement::HttpConnectionReady(e) => e.conn_id,
            Measurement::HttpRequestHeadersDone(e) => e.conn_id,
            Measurement::HttpRequestDone(e) => e.conn_id,
            Measurement::HttpResponseStart(e) => e.conn_id,
            Measurement::HttpResponseHeadersDone(e) => e.conn_id,
            Measurement::HttpResponseBodyPart(e) => e.conn_id,
            Measurement::HttpResponseDone(e) => e.conn_id,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Measurement::HttpConnectionReady(e) => e.transaction_id,
            Measurement::HttpRequestHeadersDone(e) => e.transaction_id,
            Measurement::HttpRequestDone(e) => e.transaction_id,
            Measurement::HttpResponseStart(e) => e.transaction_id,
            Measurement::HttpResponseHeadersDone(e) => e.transaction_id,
            Measurement::HttpResponseBodyPart(e) => e.transaction_id,
            Measurement::HttpResponseDone(e) => e.transaction_id,
            _ => TransactionId::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(conn: u64, error: Option<&str>) -> Measurement {
        Measurement::Close(CloseEvent {
            conn_id: ConnId::from_raw(conn),
            duration: Duration::from_millis(1),
            error: error.map(str::to_string),
            time: Duration::from_millis(250),
        })
    }

    #[test]
    fn accessors_follow_variant() {
        let m = close(4, Some("broken pipe"));
        assert_eq!(m.kind(), "close");
        assert_eq!(m.conn_id(), ConnId::from_raw(4));
        assert_eq!(m.dial_id(), DialId::NONE);
        assert_eq!(m.transaction_id(), TransactionId::NONE);
        assert_eq!(m.error(), Some("broken pipe"));
        assert_eq!(m.time(), Duration::from_millis(250));
    }

    #[test]
    fn serializes_tagged_with_seconds() {
        let json = serde_json::to_value(close(2, None)).unwrap();
        assert_eq!(json["Close"]["conn_id"], 2);
        assert_eq!(json["Close"]["time"], 0.25);
        assert!(json["Close"]["error"].is_null());
    }
}
