//! DNS over TCP and over TLS through the measuring dialer.
//!
//! # Design Decisions
//! - A new connection per query, closed once the reply is read
//! - Messages carry the two-byte big-endian length prefix of RFC 1035
//!   section 4.2.2 in both directions
//! - DoT dials through `Dialer::dial_tls`, so the handshake is measured
//!   like any other

use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::server_address;
use super::wire::{DnsTransport, ResolverError};
use crate::context::Context;
use crate::net::Dialer;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TcpTransport {
    dialer: Dialer,
    address: String,
    tls: bool,
    timeout: Duration,
}

impl TcpTransport {
    /// Plain TCP; the port defaults to 53.
    pub fn new(dialer: Dialer, address: &str) -> Result<Self, ResolverError> {
        Ok(Self {
            dialer,
            address: server_address(address, 53)?,
            tls: false,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// DNS over TLS; the port defaults to 853.
    pub fn tls(dialer: Dialer, address: &str) -> Result<Self, ResolverError> {
        Ok(Self {
            dialer,
            address: server_address(address, 853)?,
            tls: true,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bound on dialing and the whole exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl DnsTransport for TcpTransport {
    fn round_trip<'a>(&'a self, query: Vec<u8>) -> BoxFuture<'a, Result<Vec<u8>, ResolverError>> {
        Box::pin(async move {
            let ctx = Context::with_timeout(self.timeout);
            let reply = if self.tls {
                let mut conn = self.dialer.dial_tls(&ctx, "tcp", &self.address).await?;
                ctx.run(exchange(&mut conn, &query)).await??
            } else {
                let mut conn = self.dialer.dial_context(&ctx, "tcp", &self.address).await?;
                ctx.run(exchange(&mut conn, &query)).await??
            };
            Ok(reply)
        })
    }

    fn network(&self) -> &'static str {
        if self.tls {
            "dot"
        } else {
            "tcp"
        }
    }
}

/// Write one length-prefixed query and read one length-prefixed reply.
pub(crate) async fn exchange<S>(stream: &mut S, query: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "dns query longer than 65535 bytes"))?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;
    stream.flush().await?;

    let len = stream.read_u16().await?;
    let mut reply = vec![0u8; usize::from(len)];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}
