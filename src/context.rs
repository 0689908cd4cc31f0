//! Cancellation and deadlines for network operations.
//!
//! # Responsibilities
//! - Carry an optional deadline and an optional cancel signal
//! - Race any operation against "deadline reached or cancelled"
//!
//! # Design Decisions
//! - Built on Tokio's watch channel, like the shutdown coordinator
//! - Cloning a context shares its cancel signal
//! - Dropping the `CancelHandle` without cancelling never fires the signal

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Canceled,
}

impl From<ContextError> for std::io::Error {
    fn from(err: ContextError) -> Self {
        std::io::Error::new(std::io::ErrorKind::TimedOut, err)
    }
}

/// Deadline and cancellation carrier passed to every suspending operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Fires the cancel signal of the contexts created alongside it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every context sharing this signal.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Context {
    /// A context that is never done.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    /// A context plus the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: None,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(current) if current < candidate => current,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return the reason this context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Some(ContextError::Canceled);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is done.
    pub async fn done(&self) -> ContextError {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let canceled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    loop {
                        if *rx.borrow_and_update() {
                            break;
                        }
                        if rx.changed().await.is_err() {
                            // Handle dropped without cancelling.
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = canceled => ContextError::Canceled,
            _ = deadline => ContextError::DeadlineExceeded,
        }
    }

    /// Run `fut` unless the context finishes first.
    ///
    /// When the context wins, `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_never_done() {
        let ctx = Context::new();
        assert!(!ctx.is_done());
        let out = ctx.run(async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn timeout_fires() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let out = ctx.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(out, Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancel_fires_for_clones() {
        let (ctx, handle) = Context::cancellable();
        let clone = ctx.clone();
        let waiter = tokio::spawn(async move { clone.done().await });
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), ContextError::Canceled);
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let (ctx, handle) = Context::cancellable();
        drop(handle);
        let out = tokio::time::timeout(Duration::from_millis(30), ctx.done()).await;
        assert!(out.is_err());
    }

    #[test]
    fn child_keeps_earlier_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let parent = Context::with_timeout(Duration::from_millis(10));
            let child = parent.child_with_timeout(Duration::from_secs(10));
            assert_eq!(child.deadline(), parent.deadline());
        });
    }
}
