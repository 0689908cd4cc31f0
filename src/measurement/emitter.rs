//! Shared measurement state for one dialer / tracer instance.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{IdAllocator, Measurement, NoopSink, Sink};

/// Beginning instant, ID counters, byte counters and the sink.
///
/// Everything that instruments the network holds an `Arc<Emitter>`.
pub struct Emitter {
    beginning: Instant,
    sink: Arc<dyn Sink>,
    ids: IdAllocator,
    capture_payload: bool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Emitter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            beginning: Instant::now(),
            sink,
            ids: IdAllocator::new(),
            capture_payload: false,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// An emitter whose measurements go nowhere.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    /// Copy transferred bytes into Read/Write/body measurements.
    pub fn with_payload_capture(mut self, enabled: bool) -> Self {
        self.capture_payload = enabled;
        self
    }

    pub fn beginning(&self) -> Instant {
        self.beginning
    }

    /// Time elapsed between Beginning and `at`.
    pub fn since_beginning(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.beginning)
    }

    /// Time elapsed between Beginning and now.
    pub fn now(&self) -> Duration {
        self.since_beginning(Instant::now())
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn captures_payload(&self) -> bool {
        self.capture_payload
    }

    /// Hand `measurement` to the sink. A panicking sink loses the
    /// measurement but never the operation that produced it.
    pub fn emit(&self, measurement: Measurement) {
        let kind = measurement.kind();
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| self.sink.on_measurement(measurement)));
        if delivered.is_err() {
            tracing::warn!(kind, "measurement sink panicked, measurement dropped");
        }
    }

    pub(crate) fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes read by every connection of this instance.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes written by every connection of this instance.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("beginning", &self.beginning)
            .field("capture_payload", &self.capture_payload)
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{BufferSink, CloseEvent, ConnId};

    #[test]
    fn counters_accumulate() {
        let emitter = Emitter::noop();
        emitter.add_read(10);
        emitter.add_read(5);
        emitter.add_written(3);
        assert_eq!(emitter.bytes_read(), 15);
        assert_eq!(emitter.bytes_written(), 3);
    }

    #[test]
    fn times_are_relative_to_beginning() {
        let sink = Arc::new(BufferSink::new());
        let emitter = Emitter::new(sink);
        let later = emitter.beginning() + Duration::from_millis(40);
        assert_eq!(emitter.since_beginning(later), Duration::from_millis(40));
        assert!(!emitter.captures_payload());
        assert!(Emitter::noop().with_payload_capture(true).captures_payload());
    }

    #[test]
    fn panicking_sink_does_not_unwind_into_caller() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let sink = move |_: Measurement| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("sink failure");
            }
        };
        let emitter = Emitter::new(Arc::new(sink));
        let close = |n| {
            Measurement::Close(CloseEvent {
                conn_id: ConnId::from_raw(n),
                duration: Duration::ZERO,
                error: None,
                time: emitter.now(),
            })
        };
        emitter.emit(close(1));
        emitter.emit(close(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
