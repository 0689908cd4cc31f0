//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for netx.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetxConfig {
    /// Connect and payload settings.
    pub dialer: DialerConfig,

    /// Retry schedule between dial rounds.
    pub backoff: BackoffConfig,

    /// TLS client settings.
    pub tls: TlsConfig,

    /// Which resolver dials go through.
    pub resolver: ResolverConfig,

    /// HTTP transport settings.
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Per-attempt connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Whole-dial timeout used by the HTTP transport, in milliseconds.
    pub dial_timeout_ms: u64,

    /// Copy transferred bytes into I/O and body measurements.
    pub capture_payload: bool,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            dial_timeout_ms: 60_000,
            capture_payload: false,
        }
    }
}

/// Means are in seconds. Round means grow by `factor` from
/// `initial_mean_secs` up to and including `final_mean_secs`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_mean_secs: f64,
    pub final_mean_secs: f64,
    pub factor: f64,

    /// Standard deviation as a fraction of each mean.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_mean_secs: 0.5,
            final_mean_secs: 8.0,
            factor: 2.0,
            jitter: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Handshake timeout in milliseconds. Zero means the default.
    pub handshake_timeout_ms: u64,

    /// PEM bundle that replaces the web PKI roots.
    pub ca_bundle_path: Option<PathBuf>,

    /// SNI to send regardless of the dialed host.
    pub server_name: Option<String>,

    /// ALPN protocols, in preference order.
    pub alpn: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            ca_bundle_path: None,
            server_name: None,
            alpn: vec!["http/1.1".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    #[default]
    System,
    Udp,
    Tcp,
    Dot,
    Doh,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResolverConfig {
    pub kind: ResolverKind,

    /// Server `host[:port]` for `udp`, `tcp` and `dot`. The port defaults
    /// to 53, or 853 for `dot`.
    pub address: Option<String>,

    /// DNS-over-HTTPS endpoint, required when `kind = "doh"`.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Read whole response bodies before returning them.
    pub eager_body: bool,

    /// Idle connections kept per scheme, host and port.
    pub max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            eager_body: false,
            max_idle_per_host: 4,
        }
    }
}
