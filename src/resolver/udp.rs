//! DNS over UDP through the measuring dialer.

use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::server_address;
use super::wire::{DnsTransport, ResolverError};
use crate::context::Context;
use crate::net::Dialer;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest reply read from the socket.
const MAX_REPLY: usize = 1 << 17;

/// One connected UDP socket per query; every datagram is measured.
#[derive(Clone)]
pub struct UdpTransport {
    dialer: Dialer,
    address: String,
    timeout: Duration,
}

impl UdpTransport {
    /// `address` is `host[:port]`; the port defaults to 53.
    pub fn new(dialer: Dialer, address: &str) -> Result<Self, ResolverError> {
        Ok(Self {
            dialer,
            address: server_address(address, 53)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bound on dialing, sending and waiting for the reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl DnsTransport for UdpTransport {
    fn round_trip<'a>(&'a self, query: Vec<u8>) -> BoxFuture<'a, Result<Vec<u8>, ResolverError>> {
        Box::pin(async move {
            let ctx = Context::with_timeout(self.timeout);
            let mut conn = self.dialer.dial_context(&ctx, "udp", &self.address).await?;
            let reply = ctx
                .run(async {
                    let sent = conn.write(&query).await?;
                    if sent != query.len() {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram write"));
                    }
                    let mut buf = vec![0u8; MAX_REPLY];
                    let n = conn.read(&mut buf).await?;
                    buf.truncate(n);
                    Ok::<_, io::Error>(buf)
                })
                .await??;
            Ok(reply)
        })
    }

    fn network(&self) -> &'static str {
        "udp"
    }
}
