//! Bounded hand-off queue
//!
//! Fixed-capacity FIFO buffer between producers and workers. Built on a
//! multi-consumer `async_channel`, so every worker of a pool receives from
//! the same buffer and removal is atomic with the hand-off.

use std::fmt;
use std::str::FromStr;

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::error::{EngineError, Result};

/// What `put` does when the queue is at capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFullPolicy {
    /// Suspend the producer until a slot frees up
    #[default]
    Block,
    /// Fail immediately with [`EngineError::QueueFull`]
    Reject,
}

impl fmt::Display for OnFullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for OnFullPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown on_full policy '{other}', expected 'block' or 'reject'"
            ))),
        }
    }
}

/// Bounded FIFO queue with cancellation-aware blocking operations
///
/// Cloning yields another handle to the same buffer.
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    policy: OnFullPolicy,
    capacity: usize,
    token: CancellationToken,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            policy: self.policy,
            capacity: self.capacity,
            token: self.token.clone(),
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue
    ///
    /// Fails with [`EngineError::InvalidConfig`] when `capacity` is zero.
    pub fn new(capacity: usize, policy: OnFullPolicy, token: CancellationToken) -> Result<Self> {
        if capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        let (tx, rx) = async_channel::bounded(capacity);
        Ok(Self {
            tx,
            rx,
            policy,
            capacity,
            token,
        })
    }

    /// Enqueue an item
    ///
    /// - `QueueClosed` once the queue is closed
    /// - `QueueFull` when full under [`OnFullPolicy::Reject`]
    /// - `Cancelled` if the token fires while blocked (or had already fired)
    pub async fn put(&self, item: T) -> Result<()> {
        if let Some(err) = self.token.error() {
            return Err(err);
        }

        match self.policy {
            OnFullPolicy::Reject => self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => EngineError::QueueFull,
                TrySendError::Closed(_) => EngineError::QueueClosed,
            }),
            OnFullPolicy::Block => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        trace!("Blocked put released by cancellation");
                        Err(self.cancelled_error())
                    }
                    sent = self.tx.send(item) => sent.map_err(|_| EngineError::QueueClosed),
                }
            }
        }
    }

    /// Dequeue the next item
    ///
    /// Returns `None` once the queue is closed and drained, or as soon as the
    /// token fires.
    pub async fn take(&self) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = self.rx.recv() => item.ok(),
        }
    }

    /// Dequeue without waiting
    ///
    /// Ignores the token so cancellation drains can empty the buffer.
    pub fn try_take(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Stop accepting puts; buffered items remain takeable
    ///
    /// Returns `true` if this call closed the queue.
    pub fn close(&self) -> bool {
        let closed = self.tx.close();
        if closed {
            debug!(remaining = self.len(), "Queue closed");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OnFullPolicy {
        self.policy
    }

    fn cancelled_error(&self) -> EngineError {
        self.token.error().unwrap_or(EngineError::QueueClosed)
    }
}
