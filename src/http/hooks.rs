//! Wire-level events of one HTTP transaction.
//!
//! The transport wraps every pooled stream in a `HookedStream`, above TLS,
//! and installs a `WireHooks` in it for the duration of one request. The
//! stream reports the first plaintext write and read, the request body
//! reports its end, and the hooks turn those into the request-side
//! measurements in a fixed order:
//!
//! ```text
//! Idle → HeadersDone → RequestDone → ResponseStart
//! ```
//!
//! Skipped stages are emitted on the way, so every transaction that gets a
//! response produces all three. TLS records that carry no application data,
//! such as session tickets, never reach the hooks.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{BoxError, HttpBody, Trace};
use crate::measurement::{
    ConnId, HeaderList, HttpRequestDoneEvent, HttpRequestHeadersDoneEvent, HttpResponseStartEvent,
    Measurement,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Idle,
    HeadersDone,
    RequestDone,
    ResponseStart,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Idle => Stage::HeadersDone,
            Stage::HeadersDone => Stage::RequestDone,
            Stage::RequestDone | Stage::ResponseStart => Stage::ResponseStart,
        }
    }
}

/// Request line and headers as sent.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
}

#[derive(Debug)]
struct HookState {
    stage: Stage,
    body_finished: bool,
    failed: bool,
}

#[derive(Debug)]
pub struct WireHooks {
    trace: Trace,
    conn_id: ConnId,
    head: RequestHead,
    state: Mutex<HookState>,
}

impl WireHooks {
    pub(crate) fn new(trace: Trace, conn_id: ConnId, head: RequestHead, body_finished: bool) -> Self {
        Self {
            trace,
            conn_id,
            head,
            state: Mutex::new(HookState {
                stage: Stage::Idle,
                body_finished,
                failed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bytes went out on the connection.
    pub(crate) fn on_write(&self) {
        let mut state = self.lock();
        self.advance(&mut state, Stage::HeadersDone);
        if state.body_finished {
            self.advance(&mut state, Stage::RequestDone);
        }
    }

    /// Bytes came in on the connection.
    pub(crate) fn on_read(&self) {
        let mut state = self.lock();
        self.advance(&mut state, Stage::ResponseStart);
    }

    /// The request body yielded its last frame.
    pub(crate) fn on_body_finished(&self) {
        let mut state = self.lock();
        state.body_finished = true;
        if state.stage >= Stage::HeadersDone {
            self.advance(&mut state, Stage::RequestDone);
        }
    }

    /// Response headers arrived.
    pub(crate) fn on_response(&self) {
        let mut state = self.lock();
        self.advance(&mut state, Stage::ResponseStart);
    }

    /// The round trip failed before a response.
    ///
    /// If headers went out, RequestDone is emitted carrying the error.
    pub(crate) fn on_error(&self, error: &str) {
        let mut state = self.lock();
        if state.failed {
            return;
        }
        state.failed = true;
        if state.stage == Stage::HeadersDone {
            state.stage = Stage::RequestDone;
            self.emit(Stage::RequestDone, Some(error.to_string()));
        }
    }

    fn advance(&self, state: &mut HookState, target: Stage) {
        if state.failed {
            return;
        }
        while state.stage < target {
            state.stage = state.stage.next();
            self.emit(state.stage, None);
        }
    }

    fn emit(&self, stage: Stage, error: Option<String>) {
        let transaction_id = self.trace.transaction_id();
        let conn_id = self.conn_id;
        let time = self.trace.emitter().now();
        let measurement = match stage {
            Stage::Idle => return,
            Stage::HeadersDone => {
                tracing::trace!(%transaction_id, %conn_id, "request headers written");
                Measurement::HttpRequestHeadersDone(HttpRequestHeadersDoneEvent {
                    transaction_id,
                    conn_id,
                    method: self.head.method.clone(),
                    url: self.head.url.clone(),
                    headers: self.head.headers.clone(),
                    time,
                })
            }
            Stage::RequestDone => Measurement::HttpRequestDone(HttpRequestDoneEvent {
                transaction_id,
                conn_id,
                error,
                time,
            }),
            Stage::ResponseStart => Measurement::HttpResponseStart(HttpResponseStartEvent {
                transaction_id,
                conn_id,
                time,
            }),
        };
        self.trace.emitter().emit(measurement);
    }
}

/// Request body that tells the hooks when it is exhausted.
pub(crate) struct HookedBody {
    inner: HttpBody,
    hooks: Arc<WireHooks>,
    notified: bool,
}

impl HookedBody {
    pub(crate) fn new(inner: HttpBody, hooks: Arc<WireHooks>) -> Self {
        Self {
            inner,
            hooks,
            notified: false,
        }
    }

    fn finish(&mut self) {
        if !self.notified {
            self.notified = true;
            self.hooks.on_body_finished();
        }
    }
}

impl Body for HookedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            None => this.finish(),
            Some(Ok(_)) if this.inner.is_end_stream() => this.finish(),
            _ => {}
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Where the transport installs the hooks of the request in flight.
pub(crate) type HookSlot = Arc<ArcSwapOption<WireHooks>>;

/// Stream that feeds application-level reads and writes to the installed
/// hooks.
pub(crate) struct HookedStream<S> {
    inner: S,
    slot: HookSlot,
}

impl<S> HookedStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            slot: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub(crate) fn slot(&self) -> HookSlot {
        self.slot.clone()
    }

    pub(crate) fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HookedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            if let Some(hooks) = this.slot.load_full() {
                hooks.on_read();
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HookedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if n > 0 {
            if let Some(hooks) = this.slot.load_full() {
                hooks.on_write();
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
