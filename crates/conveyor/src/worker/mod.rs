//! Worker pools
//!
//! This module provides:
//! - [`WorkerPool`] - fixed-size pool with a bounded input queue
//! - [`PoolConfig`] - pool sizing, backpressure policy and stop grace period
//! - [`PoolObserver`] - per-task event hooks ([`NoopObserver`], [`TracingObserver`])
//! - [`PoolStats`] / [`PoolStatus`] - counters and lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                            │
//! │                                                               │
//! │  submit ──▶ ResultCollector.register ──▶ TaskFuture           │
//! │     │                                        ▲                │
//! │     ▼                                        │ resolve        │
//! │  ┌─────────────────────────┐                 │                │
//! │  │ BoundedQueue (Block /   │                 │                │
//! │  │ Reject, capacity k)     │                 │                │
//! │  └───────────┬─────────────┘                 │                │
//! │              ▼                               │                │
//! │  [worker 0] [worker 1] ... [worker n-1] ─────┘                │
//! │      catch_unwind per task, PoolState atomics                 │
//! │                                                               │
//! │  supervisor: joins workers, drains queue on cancellation      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod observer;
mod pool;
pub(crate) mod runtime;
mod state;

pub use observer::{NoopObserver, PoolObserver, TracingObserver};
pub use pool::{PoolConfig, WorkerPool, WorkerPoolBuilder};
pub use state::{PoolStats, PoolStatus};
