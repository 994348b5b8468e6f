//! Engine error taxonomy
//!
//! A single closed enum covers both per-task failures (stored inside a
//! [`TaskResult`](crate::TaskResult)) and pool-level failures returned from
//! management calls such as `submit` and `shutdown`.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelCause;
use crate::task::TaskId;

/// Result type alias for engine operations
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors produced by the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Queue is at capacity and the pool rejects instead of blocking
    #[error("queue is full")]
    QueueFull,

    /// Queue has been closed, no further puts are accepted
    #[error("queue is closed")]
    QueueClosed,

    /// Pool or pipeline is shutting down or was stopped
    #[error("pool is closed")]
    PoolClosed,

    /// Handler panicked while executing the task
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// Handler returned an error
    #[error("handler failed: {0}")]
    Handler(String),

    /// Cancellation fired before the task started
    #[error("cancelled ({0})")]
    Cancelled(CancelCause),

    /// A timeout or shutdown grace period elapsed
    #[error("timed out")]
    Timeout,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pool was already started
    #[error("pool is already running")]
    AlreadyRunning,

    /// A task with the same id is still pending
    #[error("task {0} is already pending")]
    DuplicateTask(TaskId),
}

/// Fieldless discriminant of [`EngineError`], used for summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueueFull,
    QueueClosed,
    PoolClosed,
    HandlerPanic,
    Handler,
    Cancelled,
    Timeout,
    InvalidConfig,
    AlreadyRunning,
    DuplicateTask,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QueueFull => "queue_full",
            Self::QueueClosed => "queue_closed",
            Self::PoolClosed => "pool_closed",
            Self::HandlerPanic => "handler_panic",
            Self::Handler => "handler",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::InvalidConfig => "invalid_config",
            Self::AlreadyRunning => "already_running",
            Self::DuplicateTask => "duplicate_task",
        };
        f.write_str(name)
    }
}

impl EngineError {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueueFull => ErrorKind::QueueFull,
            Self::QueueClosed => ErrorKind::QueueClosed,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::HandlerPanic(_) => ErrorKind::HandlerPanic,
            Self::Handler(_) => ErrorKind::Handler,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Timeout => ErrorKind::Timeout,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::AlreadyRunning => ErrorKind::AlreadyRunning,
            Self::DuplicateTask(_) => ErrorKind::DuplicateTask,
        }
    }

    /// Whether the caller can retry the same operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::DuplicateTask(_))
    }

    /// Whether the pool is going away and the caller should stop submitting
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::QueueClosed | Self::PoolClosed)
    }

    /// Flatten a handler error chain into a message
    pub(crate) fn from_handler(err: anyhow::Error) -> Self {
        Self::Handler(format!("{err:#}"))
    }

    /// Convert a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::HandlerPanic(message)
    }

    /// Map admission errors to what a submitter sees
    ///
    /// A closed queue or a fired token both mean the pool stopped taking work.
    pub(crate) fn into_submit_error(self) -> Self {
        match self {
            Self::QueueClosed | Self::Cancelled(_) => Self::PoolClosed,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::QueueFull.kind(), ErrorKind::QueueFull);
        assert_eq!(
            EngineError::HandlerPanic("boom".into()).kind(),
            ErrorKind::HandlerPanic
        );
        assert_eq!(
            EngineError::Cancelled(CancelCause::Timeout).kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(ErrorKind::HandlerPanic.to_string(), "handler_panic");
    }

    #[test]
    fn test_classification() {
        assert!(EngineError::QueueFull.is_recoverable());
        assert!(!EngineError::QueueFull.is_terminal());
        assert!(EngineError::PoolClosed.is_terminal());
        assert!(EngineError::QueueClosed.is_terminal());
        assert!(!EngineError::Timeout.is_recoverable());
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = EngineError::from_panic(Box::new("static message"));
        assert_eq!(err, EngineError::HandlerPanic("static message".into()));

        let err = EngineError::from_panic(Box::new(format!("task {}", 7)));
        assert_eq!(err, EngineError::HandlerPanic("task 7".into()));

        let err = EngineError::from_panic(Box::new(42u32));
        assert_eq!(
            err,
            EngineError::HandlerPanic("non-string panic payload".into())
        );
    }

    #[test]
    fn test_from_handler_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("fetching page");
        let converted = EngineError::from_handler(err);
        assert_eq!(
            converted,
            EngineError::Handler("fetching page: connection reset".into())
        );
    }

    #[test]
    fn test_submit_error_mapping() {
        assert_eq!(
            EngineError::QueueClosed.into_submit_error(),
            EngineError::PoolClosed
        );
        assert_eq!(
            EngineError::Cancelled(CancelCause::UserCancel).into_submit_error(),
            EngineError::PoolClosed
        );
        assert_eq!(
            EngineError::QueueFull.into_submit_error(),
            EngineError::QueueFull
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            EngineError::Cancelled(CancelCause::UserCancel).to_string(),
            "cancelled (user_cancel)"
        );
        assert_eq!(EngineError::Timeout.to_string(), "timed out");
    }
}
