//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Dial round fails:
//!     → backoff.rs (next round mean, jittered sleep)
//!     → Context (sleep interrupted by deadline or cancel)
//!     → next round, or aggregate error once the schedule is spent
//! ```
//!
//! # Design Decisions
//! - Only connect failures are retried; resolution failures are final
//! - Jitter keeps concurrent dialers from retrying in lockstep

pub mod backoff;

pub use backoff::BackoffPolicy;
