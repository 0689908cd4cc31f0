//! Correlation identifiers.
//!
//! # Responsibilities
//! - Issue dial, connection and transaction IDs
//! - Keep one independent counter per ID kind and per allocator
//!
//! # Design Decisions
//! - Zero means "not tracked"; real IDs start at 1
//! - Relaxed ordering is enough: only uniqueness and monotonicity matter
//! - Each `Emitter` owns its allocator, so unrelated instances do not share ID spaces

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! correlation_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The reserved "no ID" value.
            pub const NONE: Self = Self(0);

            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw ID value.
            pub fn as_u64(&self) -> u64 {
                self.0
            }

            pub fn is_none(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

correlation_id!(
    /// One per dial call.
    DialId,
    "dial"
);
correlation_id!(
    /// One per established connection, shared by every connect attempt of its dial.
    ConnId,
    "conn"
);
correlation_id!(
    /// One per HTTP round trip.
    TransactionId,
    "tx"
);

/// The kinds of identifiers an `IdAllocator` issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Dial,
    Connection,
    Transaction,
}

/// Per-instance source of correlation identifiers.
#[derive(Debug, Default)]
pub struct IdAllocator {
    dial: AtomicU64,
    connection: AtomicU64,
    transaction: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next ID of the given kind. Never returns zero.
    pub fn next(&self, kind: IdKind) -> u64 {
        let counter = match kind {
            IdKind::Dial => &self.dial,
            IdKind::Connection => &self.connection,
            IdKind::Transaction => &self.transaction,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_dial(&self) -> DialId {
        DialId(self.next(IdKind::Dial))
    }

    pub fn next_conn(&self) -> ConnId {
        ConnId(self.next(IdKind::Connection))
    }

    pub fn next_transaction(&self) -> TransactionId {
        TransactionId(self.next(IdKind::Transaction))
    }
}
