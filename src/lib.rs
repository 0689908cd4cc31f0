//! netx: network measurement instrumentation.
//!
//! Wraps name resolution, dialing, TLS and HTTP/1.1 round trips so that
//! every step produces a timestamped `Measurement`, correlated by dial,
//! connection and transaction IDs.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──► BufferBody ──► Tracer ──► HttpTransport ──┐
//!                                                        ▼
//!   caller ─────────────────────────────────────────► Dialer ──► MeasuringResolver ──► LookupHost
//!                                                        │
//!                                                        ▼
//!                                               MeasuringConn ──► TlsConn
//!                                                        │
//!                          every layer ──► Emitter ──► Sink (buffer, channel, closure)
//! ```

// Core subsystems
pub mod context;
pub mod measurement;
pub mod net;
pub mod resolver;
pub mod http;

// Cross-cutting concerns
pub mod config;
pub mod observability;
pub mod resilience;

pub use config::NetxConfig;
pub use context::{CancelHandle, Context, ContextError};
pub use measurement::{Emitter, Measurement, Sink};
pub use net::{DialError, Dialer, MeasuringConn, TlsConn, TlsError};
