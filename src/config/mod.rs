//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NetxConfig (validated, immutable)
//!     → Dialer::from_config / HttpTransport::from_config
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Backoff constants live here rather than in the dialer

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{BackoffConfig, DialerConfig, HttpConfig, NetxConfig, ResolverConfig, ResolverKind, TlsConfig};
pub use validation::ValidationError;
