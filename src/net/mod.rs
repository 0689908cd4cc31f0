//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! dial(network, "host:port")
//!     → addr.rs (parse network and address)
//!     → resolver (measured lookup, skipped for IP literals)
//!     → dialer.rs (connect each address, back off between rounds)
//!     → connection.rs (measured reads, writes and close)
//!     → tls.rs (optional measured handshake)
//!     → Hand off to caller or HTTP transport
//! ```
//!
//! # Design Decisions
//! - Every connection carries the `ConnId` allocated at dial time
//! - Retry rounds share that ID, so attempts of one dial group together
//! - TLS sits on top of the measured connection, so I/O is ciphertext

pub mod addr;
pub mod connection;
pub mod dialer;
pub mod tls;

pub use addr::{join_host_port, split_host_port, AddrError, Network, UnknownNetwork};
pub use connection::{MeasuringConn, Socket};
pub use dialer::{DialError, Dialer};
pub use tls::{TlsConn, TlsError};
