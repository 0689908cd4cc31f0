//! Per-transaction tracing of HTTP round trips.
//!
//! # Responsibilities
//! - Allocate a `TransactionId` per round trip and attach a `Trace` carrier
//!   to the request extensions
//! - Emit ResponseHeadersDone once headers arrive
//! - Wrap the response body to measure each part and the end of the body
//!
//! # Design Decisions
//! - The carrier lives in the request, so concurrent round trips never
//!   share state
//! - An existing carrier is replaced; the inner-most tracer owns the wire
//!   events of its request
//! - ResponseDone is emitted exactly once: at end of stream, on a body
//!   error, or when the body is dropped early

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use tower::{Layer, Service, ServiceExt};

use super::{header_list, BoxError, HttpBody, HttpError, RoundTrip};
use crate::measurement::{
    ConnId, Emitter, HttpResponseBodyPartEvent, HttpResponseDoneEvent, HttpResponseHeadersDoneEvent,
    Measurement, TransactionId,
};

/// Carrier of one transaction's identity, stored in request extensions.
#[derive(Clone)]
pub struct Trace {
    transaction_id: TransactionId,
    emitter: Arc<Emitter>,
}

impl Trace {
    pub fn new(transaction_id: TransactionId, emitter: Arc<Emitter>) -> Self {
        Self {
            transaction_id,
            emitter,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("transaction_id", &self.transaction_id)
            .finish()
    }
}

#[derive(Clone)]
pub struct TraceLayer {
    emitter: Arc<Emitter>,
}

impl TraceLayer {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self { emitter }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = Tracer<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Tracer::new(inner, self.emitter.clone())
    }
}

/// Service that traces every round trip through `inner`.
#[derive(Clone)]
pub struct Tracer<S> {
    inner: S,
    emitter: Arc<Emitter>,
}

impl<S> Tracer<S> {
    pub fn new(inner: S, emitter: Arc<Emitter>) -> Self {
        Self { inner, emitter }
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, F> Service<Request<HttpBody>> for Tracer<S>
where
    S: Service<Request<HttpBody>, Response = Response<HttpBody>, Error = HttpError, Future = F>
        + Clone
        + Send
        + 'static,
    F: std::future::Future<Output = Result<Response<HttpBody>, HttpError>> + Send + 'static,
{
    type Response = Response<HttpBody>;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<HttpBody>) -> Self::Future {
        let transaction_id = self.emitter.ids().next_transaction();
        let trace = Trace::new(transaction_id, self.emitter.clone());
        req.extensions_mut().insert(trace.clone());
        tracing::debug!(%transaction_id, method = %req.method(), uri = %req.uri(), "round trip");

        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let response = match inner.call(req).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(%transaction_id, error = %e, "round trip failed");
                    return Err(e);
                }
            };
            let conn_id = response.extensions().get::<ConnId>().copied().unwrap_or(ConnId::NONE);
            trace.emitter.emit(Measurement::HttpResponseHeadersDone(HttpResponseHeadersDoneEvent {
                transaction_id,
                conn_id,
                status: response.status().as_u16(),
                headers: header_list(response.headers()),
                time: trace.emitter.now(),
            }));
            tracing::debug!(%transaction_id, %conn_id, status = response.status().as_u16(), "response headers");

            let (mut parts, body) = response.into_parts();
            parts.extensions.insert(transaction_id);
            let body = TracedBody::new(body, trace, conn_id).boxed_unsync();
            Ok(Response::from_parts(parts, body))
        })
    }
}

impl<S> RoundTrip for Tracer<S>
where
    S: Service<Request<HttpBody>, Response = Response<HttpBody>, Error = HttpError> + Clone + Send + Sync + 'static,
    S::Future: Send,
{
    fn round_trip(&self, req: Request<HttpBody>) -> BoxFuture<'static, Result<Response<HttpBody>, HttpError>> {
        Box::pin(self.clone().oneshot(req))
    }
}

/// Response body that measures each data frame and the end of the body.
pub struct TracedBody {
    inner: HttpBody,
    trace: Trace,
    conn_id: ConnId,
    read_started: Option<Instant>,
    done: bool,
}

impl TracedBody {
    pub fn new(inner: HttpBody, trace: Trace, conn_id: ConnId) -> Self {
        Self {
            inner,
            trace,
            conn_id,
            read_started: None,
            done: false,
        }
    }

    fn part(&self, start: Instant, data: Option<&Bytes>, error: Option<String>) {
        let stop = Instant::now();
        let emitter = &self.trace.emitter;
        let num_bytes = data.map_or(0, Bytes::len);
        emitter.emit(Measurement::HttpResponseBodyPart(HttpResponseBodyPartEvent {
            transaction_id: self.trace.transaction_id,
            conn_id: self.conn_id,
            num_bytes: num_bytes as u64,
            data: data.filter(|_| emitter.captures_payload()).cloned(),
            duration: stop.duration_since(start),
            error,
            time: emitter.since_beginning(stop),
        }));
    }

    fn finish(&mut self, error: Option<String>) {
        if self.done {
            return;
        }
        self.done = true;
        let transaction_id = self.trace.transaction_id;
        tracing::debug!(%transaction_id, error = ?error, "response done");
        self.trace.emitter.emit(Measurement::HttpResponseDone(HttpResponseDoneEvent {
            transaction_id,
            conn_id: self.conn_id,
            error,
            time: self.trace.emitter.now(),
        }));
    }
}

impl Body for TracedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let start = *this.read_started.get_or_insert_with(Instant::now);
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        this.read_started = None;
        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.part(start, Some(data), None);
                }
            }
            Some(Err(e)) => {
                let error = e.to_string();
                this.part(start, None, Some(error.clone()));
                this.finish(Some(error));
            }
            None => this.finish(None),
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TracedBody {
    fn drop(&mut self) {
        self.finish(None);
    }
}
