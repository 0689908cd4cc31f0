//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (means >= 0, factor > 0, jitter >= 0)
//! - Check that a DoH resolver has a usable URL and that UDP, TCP and DoT
//!   resolvers have a server address
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NetxConfig → Result<(), Vec<ValidationError>>

use std::fmt;

use url::Url;

use crate::config::schema::{NetxConfig, ResolverKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &NetxConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field, message: String| errors.push(ValidationError { field, message });

    let backoff = &config.backoff;
    for (field, value) in [
        ("backoff.initial_mean_secs", backoff.initial_mean_secs),
        ("backoff.final_mean_secs", backoff.final_mean_secs),
        ("backoff.jitter", backoff.jitter),
    ] {
        if !value.is_finite() || value < 0.0 {
            fail(field, format!("must be a finite number >= 0, got {value}"));
        }
    }
    if !backoff.factor.is_finite() || backoff.factor <= 0.0 {
        fail("backoff.factor", format!("must be > 0, got {}", backoff.factor));
    }
    if backoff.final_mean_secs < backoff.initial_mean_secs {
        fail(
            "backoff.final_mean_secs",
            "must not be smaller than initial_mean_secs".to_string(),
        );
    }

    if config.dialer.connect_timeout_ms == 0 {
        fail("dialer.connect_timeout_ms", "must be > 0".to_string());
    }

    match config.resolver.kind {
        ResolverKind::System => {}
        ResolverKind::Doh => match config.resolver.url.as_deref().map(Url::parse) {
            None => fail("resolver.url", "required when kind = \"doh\"".to_string()),
            Some(Err(e)) => fail("resolver.url", e.to_string()),
            Some(Ok(url)) if !matches!(url.scheme(), "http" | "https") => {
                fail("resolver.url", format!("unsupported scheme {:?}", url.scheme()))
            }
            Some(Ok(_)) => {}
        },
        ResolverKind::Udp | ResolverKind::Tcp | ResolverKind::Dot => {
            if config.resolver.address.as_deref().map_or(true, |a| a.trim().is_empty()) {
                fail("resolver.address", format!("required when kind = {:?}", config.resolver.kind));
            }
        }
    }

    if config.tls.alpn.iter().any(|p| p.is_empty() || p.len() > 255) {
        fail("tls.alpn", "protocol names must be 1 to 255 bytes".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
