//! DNS over HTTPS (RFC 8484) with wire-format messages.
//!
//! Queries are POSTed through any `RoundTrip` client. When that client is a
//! `Tracer` sharing the outer dialer's emitter, every query shows up as its
//! own nested HTTP transaction, distinct from the transaction that caused
//! the lookup.

use futures_util::future::BoxFuture;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use url::Url;

use super::wire::{DnsTransport, ResolverError};
use crate::http::{full, HttpError, RoundTrip};

const DNS_MESSAGE: &str = "application/dns-message";

#[derive(Debug, Clone)]
pub struct DohTransport<C> {
    client: C,
    url: Url,
}

impl<C: RoundTrip> DohTransport<C> {
    pub fn new(client: C, url: &str) -> Result<Self, ResolverError> {
        let url = Url::parse(url).map_err(|_| ResolverError::InvalidUrl(url.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolverError::InvalidUrl(url.to_string()));
        }
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl<C: RoundTrip> DnsTransport for DohTransport<C> {
    fn round_trip<'a>(&'a self, query: Vec<u8>) -> BoxFuture<'a, Result<Vec<u8>, ResolverError>> {
        Box::pin(async move {
            let request = Request::post(self.url.as_str())
                .header(CONTENT_TYPE, DNS_MESSAGE)
                .header(ACCEPT, DNS_MESSAGE)
                .body(full(query))
                .map_err(HttpError::from)?;

            let response = self.client.round_trip(request).await?;
            if response.status() != StatusCode::OK {
                return Err(ResolverError::Status(response.status().as_u16()));
            }
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if content_type != DNS_MESSAGE {
                return Err(ResolverError::ContentType(content_type.to_string()));
            }
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(ResolverError::Body)?
                .to_bytes();
            Ok(body.to_vec())
        })
    }

    fn network(&self) -> &'static str {
        "doh"
    }

    /// RFC 8484 section 4.1 asks for ID zero.
    fn next_query_id(&self) -> u16 {
        0
    }
}
