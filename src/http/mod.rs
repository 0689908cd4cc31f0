//! HTTP client instrumentation subsystem.
//!
//! # Data Flow
//! ```text
//! Request<HttpBody>
//!     → buffer.rs (optional: read the whole body before returning)
//!     → tracer.rs (allocate TransactionId, attach Trace to extensions)
//!     → transport.rs (pooled HTTP/1.1 over measured TCP/TLS)
//!         → hooks.rs (wire events from plaintext reads and writes)
//!     ← Response headers measured, body wrapped to measure each part
//! ```
//!
//! # Design Decisions
//! - The per-transaction carrier is a typed request extension, never a
//!   mutable hook object on a shared context
//! - Request-side events are ordered: headers done, request done,
//!   response start

pub mod buffer;
pub mod hooks;
pub mod tracer;
pub mod transport;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use thiserror::Error;

use crate::context::ContextError;
use crate::measurement::HeaderList;
use crate::net::{DialError, TlsError};

pub use buffer::{BufferBody, BufferBodyLayer};
pub use tracer::{Trace, TraceLayer, TracedBody, Tracer};
pub use transport::HttpTransport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through every layer.
pub type HttpBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid request URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: &'static str },
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("http: {0}")]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Http(#[from] http::Error),
    #[error("reading response body: {0}")]
    Body(BoxError),
    #[error("http round trip: {0}")]
    Interrupted(#[from] ContextError),
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        match self {
            HttpError::Dial(e) => e.is_timeout(),
            HttpError::Tls(e) => e.is_timeout(),
            HttpError::Hyper(e) => e.is_timeout(),
            HttpError::Interrupted(e) => *e == ContextError::DeadlineExceeded,
            _ => false,
        }
    }
}

/// A client that turns a request into a response.
pub trait RoundTrip: Send + Sync {
    fn round_trip(&self, req: Request<HttpBody>) -> BoxFuture<'static, Result<Response<HttpBody>, HttpError>>;
}

pub fn empty() -> HttpBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Flatten headers in wire order, lossily decoding non-UTF-8 values.
pub(crate) fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
