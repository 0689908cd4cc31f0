//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (connect, handshake, round trip, retry decisions)
//!     → logging.rs (subscriber, filter, stderr writer)
//!
//! Measurements are separate: they flow through `measurement::Sink`.
//! ```
//!
//! # Design Decisions
//! - Logs never replace measurements; they describe what the code did
//! - Connection, dial and transaction IDs appear as structured fields

pub mod logging;

pub use logging::{init_logging, DEFAULT_FILTER};
