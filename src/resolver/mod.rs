//! Hostname resolution.
//!
//! # Data Flow
//! ```text
//! Dialer ──► MeasuringResolver ──► dyn LookupHost ──► SystemResolver
//!                   │                                 StaticResolver
//!                   ▼                                 WireResolver ──► UdpTransport
//!             Resolve measurement                                 TcpTransport (TCP, DoT)
//!                                                                 DohTransport ──► traced HTTP
//! ```

pub mod doh;
pub mod measuring;
pub mod tcp;
pub mod udp;
pub mod wire;

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::config::{NetxConfig, ResolverKind};
use crate::http::{BufferBody, HttpTransport, Tracer};
use crate::measurement::Emitter;
use crate::net::{join_host_port, split_host_port, Dialer};

pub use doh::DohTransport;
pub use measuring::MeasuringResolver;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
pub use wire::{DnsTransport, ResolverError, WireResolver};

/// Anything that maps a hostname to addresses.
pub trait LookupHost: Send + Sync {
    fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// The operating system resolver, via `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl LookupHost for SystemResolver {
    fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let mut addrs: Vec<IpAddr> = Vec::new();
            for sa in tokio::net::lookup_host((host, 0)).await? {
                if !addrs.contains(&sa.ip()) {
                    addrs.push(sa.ip());
                }
            }
            Ok(addrs)
        })
    }
}

/// Fixed host table. Unknown names fail with `NotFound`.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.hosts.insert(host.into(), addrs.into_iter().collect());
        self
    }
}

impl LookupHost for StaticResolver {
    fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        let result = self
            .hosts
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such host: {host}")));
        Box::pin(async move { result })
    }
}

/// `address` with `default_port` appended when it has none.
pub(crate) fn server_address(address: &str, default_port: u16) -> Result<String, ResolverError> {
    let address = address.trim();
    let bare = address.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return Ok(join_host_port(bare, default_port));
    }
    if split_host_port(address).is_ok() {
        return Ok(address.to_string());
    }
    if address.is_empty() || address.contains([':', '[', ']', '/']) {
        return Err(ResolverError::InvalidAddress(address.to_string()));
    }
    Ok(join_host_port(address, default_port))
}

/// Build the resolver selected by the `resolver` section.
///
/// Wire-format resolvers send their queries through a dedicated dialer
/// sharing `emitter`, so every exchange is measured next to the dial that
/// triggered it. DoH additionally traces each query as its own HTTP
/// transaction.
pub fn from_config(config: &NetxConfig, emitter: &Arc<Emitter>) -> Result<Arc<dyn LookupHost>, ResolverError> {
    let section = &config.resolver;
    let address = || {
        section
            .address
            .as_deref()
            .ok_or_else(|| ResolverError::InvalidAddress(String::new()))
    };
    let dialer = || Dialer::from_config(config, emitter.clone());
    let resolver: Arc<dyn LookupHost> = match section.kind {
        ResolverKind::System => Arc::new(SystemResolver),
        ResolverKind::Udp => Arc::new(WireResolver::new(UdpTransport::new(dialer()?, address()?)?)),
        ResolverKind::Tcp => Arc::new(WireResolver::new(TcpTransport::new(dialer()?, address()?)?)),
        ResolverKind::Dot => Arc::new(WireResolver::new(TcpTransport::tls(dialer()?, address()?)?)),
        ResolverKind::Doh => {
            let url = section
                .url
                .as_deref()
                .ok_or_else(|| ResolverError::InvalidUrl(String::new()))?;
            let transport = HttpTransport::from_config(config, dialer()?);
            let client = BufferBody::new(Tracer::new(transport, emitter.clone()));
            Arc::new(WireResolver::new(DohTransport::new(client, url)?))
        }
    };
    tracing::info!(
        kind = ?section.kind,
        address = section.address.as_deref(),
        url = section.url.as_deref(),
        "resolver configured"
    );
    Ok(resolver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_table_lookup() {
        let resolver = StaticResolver::new().with_host("a.test", ["10.0.0.1".parse().unwrap()]);
        assert_eq!(
            resolver.lookup_host("a.test").await.unwrap(),
            vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
        );
        let err = resolver.lookup_host("b.test").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn doh_without_url_is_rejected() {
        let mut config = NetxConfig::default();
        config.resolver.kind = ResolverKind::Doh;
        let emitter = Arc::new(Emitter::noop());
        assert!(matches!(from_config(&config, &emitter), Err(ResolverError::InvalidUrl(_))));
    }

    #[test]
    fn wire_kinds_need_an_address() {
        let emitter = Arc::new(Emitter::noop());
        for kind in [ResolverKind::Udp, ResolverKind::Tcp, ResolverKind::Dot] {
            let mut config = NetxConfig::default();
            config.resolver.kind = kind;
            assert!(matches!(from_config(&config, &emitter), Err(ResolverError::InvalidAddress(_))));
            config.resolver.address = Some("192.0.2.53".to_string());
            assert!(from_config(&config, &emitter).is_ok());
        }
    }

    #[test]
    fn server_address_defaults_port() {
        assert_eq!(server_address("192.0.2.1", 53).unwrap(), "192.0.2.1:53");
        assert_eq!(server_address("2001:db8::1", 853).unwrap(), "[2001:db8::1]:853");
        assert_eq!(server_address("[2001:db8::1]", 53).unwrap(), "[2001:db8::1]:53");
        assert_eq!(server_address("[2001:db8::1]:5353", 53).unwrap(), "[2001:db8::1]:5353");
        assert_eq!(server_address("dns.example", 853).unwrap(), "dns.example:853");
        assert_eq!(server_address("dns.example:53", 853).unwrap(), "dns.example:53");
        assert!(server_address("", 53).is_err());
        assert!(server_address("dns.example:http", 53).is_err());
    }

    #[tokio::test]
    async fn system_resolver_handles_literals() {
        let addrs = SystemResolver.lookup_host("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
