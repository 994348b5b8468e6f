//! Per-pool runtime state
//!
//! Counters are updated with atomic operations only; nothing here takes a
//! lock on the task path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Created, workers not launched yet
    Idle,
    /// Workers are running and the pool accepts tasks
    Running,
    /// Input closed or cancellation fired, workers are finishing
    Draining,
    /// Every worker has exited
    Stopped,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time snapshot of a pool's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Pool or stage name
    pub name: String,
    /// Workers currently alive
    pub active_workers: usize,
    /// Handler invocations currently running
    pub in_flight: usize,
    /// Tasks admitted but not yet resolved (queued plus in flight)
    pub outstanding: usize,
    /// Tasks waiting in the queue
    pub queued: usize,
    /// Whether the pool stopped accepting tasks
    pub shutdown: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    active_workers: AtomicUsize,
    in_flight: AtomicUsize,
    outstanding: AtomicUsize,
    shutdown: AtomicBool,
}

impl PoolState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_exited(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn task_admitted(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    /// Admitted task left the pool (resolved, or its put failed)
    pub(crate) fn task_resolved(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn invocation_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn invocation_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Mark the pool closed to submissions; returns `true` on the first call
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self, name: &str, queued: usize) -> PoolStats {
        PoolStats {
            name: name.to_string(),
            active_workers: self.active_workers(),
            in_flight: self.in_flight(),
            outstanding: self.outstanding.load(Ordering::Relaxed),
            queued,
            shutdown: self.is_shutdown(),
        }
    }
}
