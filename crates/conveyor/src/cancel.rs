//! Cooperative cancellation and timeouts
//!
//! A [`CancellationToken`] is a one-shot flag with an attached
//! [`CancelCause`]. Every blocking operation in the engine (queue put/take,
//! the worker invocation boundary, fan-in) is composed with the token, so
//! firing it releases waiters within one scheduler turn. Handler bodies that
//! are already running are never preempted.
//!
//! # Example
//!
//! ```
//! use conveyor_engine::{CancelCause, CancellationToken};
//!
//! let token = CancellationToken::new();
//! assert!(token.fire(CancelCause::UserCancel));
//! assert!(!token.fire(CancelCause::Timeout)); // first cause wins
//! assert_eq!(token.cause(), Some(CancelCause::UserCancel));
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{
    CancellationToken as Signal, WaitForCancellationFuture, WaitForCancellationFutureOwned,
};
use tracing::debug;

use crate::error::EngineError;

/// Why cancellation fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    /// Explicit cancel from a caller
    UserCancel,
    /// A timeout elapsed
    Timeout,
    /// An upstream stage failed and the pipeline fails fast
    UpstreamFailure,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserCancel => write!(f, "user_cancel"),
            Self::Timeout => write!(f, "timeout"),
            Self::UpstreamFailure => write!(f, "upstream_failure"),
        }
    }
}

/// Shared one-shot cancellation signal
///
/// Clones observe the same state. Once fired the token stays fired and keeps
/// the first cause it was given.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    signal: Signal,
    cause: OnceLock<CancelCause>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token
    ///
    /// Returns `true` if this call fired it, `false` if it had already fired
    /// (the earlier cause is kept).
    pub fn fire(&self, cause: CancelCause) -> bool {
        let won = self.inner.cause.set(cause).is_ok();
        // The cause is visible before any waiter wakes.
        self.inner.signal.cancel();
        if won {
            debug!(%cause, "Cancellation fired");
        }
        won
    }

    /// Lock-free fired check
    pub fn is_fired(&self) -> bool {
        self.inner.cause.get().is_some()
    }

    /// The cause the token fired with
    pub fn cause(&self) -> Option<CancelCause> {
        self.inner.cause.get().copied()
    }

    /// Wait until the token fires
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.signal.cancelled()
    }

    /// Owned variant of [`cancelled`](Self::cancelled) for `'static` futures
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.inner.signal.clone().cancelled_owned()
    }

    /// Fire with [`CancelCause::Timeout`] after `after`, unless fired earlier
    ///
    /// Must be called inside a tokio runtime. The timer is disarmed when the
    /// returned guard is dropped; use [`TimeoutGuard::detach`] to keep it
    /// running without holding the guard.
    pub fn timeout(&self, after: Duration) -> TimeoutGuard {
        let deadline = Instant::now() + after;
        let token = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    token.fire(CancelCause::Timeout);
                }
                _ = token.cancelled() => {}
            }
        });
        TimeoutGuard {
            handle: Some(handle),
            deadline,
        }
    }

    /// The error a task sees when this token has fired
    pub(crate) fn error(&self) -> Option<EngineError> {
        self.cause().map(EngineError::Cancelled)
    }
}

/// Armed timeout created by [`CancellationToken::timeout`]
#[must_use = "dropping the guard disarms the timeout"]
#[derive(Debug)]
pub struct TimeoutGuard {
    handle: Option<JoinHandle<()>>,
    deadline: Instant,
}

impl TimeoutGuard {
    /// When the timeout fires
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancel the timer without firing the token
    pub fn disarm(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Let the timer run to its deadline independently of this guard
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cause_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_fired());
        assert_eq!(token.cause(), None);

        assert!(token.fire(CancelCause::UpstreamFailure));
        assert!(!token.fire(CancelCause::UserCancel));
        assert!(token.is_fired());
        assert_eq!(token.cause(), Some(CancelCause::UpstreamFailure));
        assert_eq!(
            token.error(),
            Some(EngineError::Cancelled(CancelCause::UpstreamFailure))
        );
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.fire(CancelCause::UserCancel);
        assert!(token.is_fired());
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(CancelCause::UserCancel.to_string(), "user_cancel");
        assert_eq!(CancelCause::Timeout.to_string(), "timeout");
        assert_eq!(CancelCause::UpstreamFailure.to_string(), "upstream_failure");
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_fire() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled_owned().await })
        };
        token.fire(CancelCause::UserCancel);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_with_timeout_cause() {
        let token = CancellationToken::new();
        let guard = token.timeout(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_fired());

        token.cancelled().await;
        assert_eq!(token.cause(), Some(CancelCause::Timeout));
        assert!(Instant::now() >= guard.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timeout_never_fires() {
        let token = CancellationToken::new();
        token.timeout(Duration::from_millis(100)).disarm();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!token.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_cancel_keeps_its_cause() {
        let token = CancellationToken::new();
        let guard = token.timeout(Duration::from_millis(100));
        token.fire(CancelCause::UserCancel);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(token.cause(), Some(CancelCause::UserCancel));
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_timeout_still_fires() {
        let token = CancellationToken::new();
        token.timeout(Duration::from_millis(10)).detach();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(token.cause(), Some(CancelCause::Timeout));
    }
}
