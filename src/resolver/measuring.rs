//! Resolver wrapper that emits one `Resolve` measurement per lookup.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;

use super::{LookupHost, SystemResolver};
use crate::context::Context;
use crate::measurement::{DialId, Emitter, Measurement, ResolveEvent};

#[derive(Clone)]
pub struct MeasuringResolver {
    inner: Arc<dyn LookupHost>,
    emitter: Arc<Emitter>,
}

impl MeasuringResolver {
    pub fn new(inner: Arc<dyn LookupHost>, emitter: Arc<Emitter>) -> Self {
        Self { inner, emitter }
    }

    pub fn system(emitter: Arc<Emitter>) -> Self {
        Self::new(Arc::new(SystemResolver), emitter)
    }

    /// Resolve `host`, attributing the measurement to `dial_id`.
    ///
    /// Exactly one measurement is emitted, whether the lookup succeeds,
    /// fails, or is interrupted by `ctx`.
    pub async fn resolve(&self, ctx: &Context, host: &str, dial_id: DialId) -> io::Result<Vec<IpAddr>> {
        let start = Instant::now();
        let result = match ctx.run(self.inner.lookup_host(host)).await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };
        let stop = Instant::now();
        match &result {
            Ok(addrs) => tracing::debug!(%dial_id, host, ?addrs, "resolve done"),
            Err(e) => tracing::debug!(%dial_id, host, error = %e, "resolve failed"),
        }
        self.emitter.emit(Measurement::Resolve(ResolveEvent {
            dial_id,
            hostname: host.to_string(),
            addresses: result.as_ref().map(Clone::clone).unwrap_or_default(),
            duration: stop.duration_since(start),
            error: result.as_ref().err().map(ToString::to_string),
            time: self.emitter.since_beginning(stop),
        }));
        result
    }
}

impl LookupHost for MeasuringResolver {
    fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move { self.resolve(&Context::new(), host, DialId::NONE).await })
    }
}
