//! Network names and `host:port` parsing.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Transport and address family requested by a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    /// Whether `ip` belongs to the family this network is restricted to.
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
            Network::Tcp | Network::Udp => true,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for network names we do not dial.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported network {0:?}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

/// Why an address could not be split.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("address {address:?}: {reason}")]
pub struct AddrError {
    pub address: String,
    pub reason: &'static str,
}

/// Split `host:port` or `[v6host]:port`.
///
/// The returned host never carries brackets.
pub fn split_host_port(address: &str) -> Result<(&str, u16), AddrError> {
    let fail = |reason| AddrError {
        address: address.to_string(),
        reason,
    };
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| fail("missing ']' in address"))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| fail("missing port in address"))?;
        (host, port)
    } else {
        let colon = address.rfind(':').ok_or_else(|| fail("missing port in address"))?;
        let host = &address[..colon];
        if host.contains(':') {
            return Err(fail("too many colons in address"));
        }
        (host, &address[colon + 1..])
    };
    if port.is_empty() {
        return Err(fail("missing port in address"));
    }
    let port = port.parse::<u16>().map_err(|_| fail("invalid port"))?;
    Ok((host, port))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
