//! Measurement sinks.
//!
//! # Design Decisions
//! - Push sinks are called synchronously and possibly concurrently
//! - Delivery is best-effort: a sink can never fail a network operation
//! - A poisoned buffer lock is recovered rather than propagated

use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::Measurement;

/// Receives measurements as they happen.
pub trait Sink: Send + Sync {
    fn on_measurement(&self, measurement: Measurement);
}

impl<F> Sink for F
where
    F: Fn(Measurement) + Send + Sync,
{
    fn on_measurement(&self, measurement: Measurement) {
        self(measurement)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl Sink for NoopSink {
    fn on_measurement(&self, _measurement: Measurement) {}
}

/// Append-only buffer drained with `pop_all`.
#[derive(Debug, Default)]
pub struct BufferSink {
    buffer: Mutex<Vec<Measurement>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Measurement>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically take every buffered measurement.
    pub fn pop_all(&self) -> Vec<Measurement> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Sink for BufferSink {
    fn on_measurement(&self, measurement: Measurement) {
        self.lock().push(measurement);
    }
}

/// Forwards measurements to an async consumer.
///
/// Once the receiver is gone measurements are dropped silently.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Measurement>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Measurement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn on_measurement(&self, measurement: Measurement) {
        let _ = self.tx.send(measurement);
    }
}
