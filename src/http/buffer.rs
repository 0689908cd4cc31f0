//! Eager response bodies.
//!
//! `BufferBody` reads the whole response body before handing the response
//! back, so every body measurement, including ResponseDone, has been
//! emitted by the time the caller sees the response. The buffered bytes
//! are replayed as a fresh body.

use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body_util::BodyExt;
use tower::{Layer, Service, ServiceExt};

use super::{full, HttpBody, HttpError, RoundTrip};

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferBodyLayer;

impl<S> Layer<S> for BufferBodyLayer {
    type Service = BufferBody<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BufferBody { inner }
    }
}

#[derive(Debug, Clone)]
pub struct BufferBody<S> {
    inner: S,
}

impl<S> BufferBody<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, F> Service<Request<HttpBody>> for BufferBody<S>
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

    fn call(&mut self, req: Request<HttpBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let response = inner.call(req).await?;
            let (parts, body) = response.into_parts();
            let bytes = body.collect().await.map_err(HttpError::Body)?.to_bytes();
            Ok(Response::from_parts(parts, full(bytes)))
        })
    }
}

impl<S> RoundTrip for BufferBody<S>
where
    S: Service<Request<HttpBody>, Response = Response<HttpBody>, Error = HttpError> + Clone + Send + Sync + 'static,
    S::Future: Send,
{
    fn round_trip(&self, req: Request<HttpBody>) -> BoxFuture<'static, Result<Response<HttpBody>, HttpError>> {
        Box::pin(self.clone().oneshot(req))
    }
}
