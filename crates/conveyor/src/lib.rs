//! Conveyor: in-process concurrent task execution
//!
//! Bounded worker pools, typed multi-stage pipelines, fan-out / fan-in
//! helpers and cooperative cancellation on top of tokio.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           Application                             │
//! │    submit(payload) ──▶ TaskFuture ──▶ wait_all ──▶ BatchOutcome   │
//! └────────────┬──────────────────────────────────────────▲───────────┘
//!              │                                          │
//!              ▼                                          │
//! ┌──────────────────────────────┐            ┌───────────┴───────────┐
//! │  WorkerPool / Pipeline stage │            │    ResultCollector    │
//! │  ┌────────────────────────┐  │  results   │  (one future per id)  │
//! │  │ BoundedQueue           │  ├───────────▶│                       │
//! │  │ Block | Reject         │  │            └───────────────────────┘
//! │  └──────────┬─────────────┘  │
//! │             ▼                │     CancellationToken (shared)
//! │   [w0] [w1] ... [wn-1]       │◀─── fire(UserCancel | Timeout |
//! │   catch_unwind per task      │          UpstreamFailure)
//! └──────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Every admitted task resolves exactly once: value, handler error,
//!   panic, `Cancelled` (never started) or `PoolClosed`/`Timeout`.
//! - Queues never hold more than their capacity.
//! - A panicking handler fails only its own task.
//! - Firing the token releases every blocked `put`, `take` and fan-in
//!   within one scheduler turn. Running handlers are not preempted.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use conveyor_engine::prelude::*;
//!
//! # async fn run() -> conveyor_engine::Result<()> {
//! let pool = WorkerPool::new(PoolConfig::new("fetch").with_worker_count(8), |task| async move {
//!     let url: String = task.into_payload();
//!     anyhow::Ok(url.len())
//! })?;
//! pool.start()?;
//!
//! let mut futures = Vec::new();
//! for url in ["a", "bb", "ccc"] {
//!     futures.push(pool.submit(url.to_string()).await?);
//! }
//! let batch = wait_all(futures).await;
//! assert!(batch.is_success());
//!
//! pool.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod collector;
pub mod error;
pub mod merge;
pub mod pipeline;
mod port;
pub mod queue;
pub mod task;
pub mod worker;

pub use cancel::{CancelCause, CancellationToken, TimeoutGuard};
pub use collector::{wait_all, BatchOutcome, CollectorStats, ResultCollector, TaskFuture};
pub use error::{EngineError, ErrorKind, Result};
pub use merge::{fan_in, fan_out, fan_out_indexed, reordered, FanIn, FanOut, Reorder};
pub use pipeline::{Pipeline, PipelineBuilder, Stage, StageConfig};
pub use queue::{BoundedQueue, OnFullPolicy};
pub use task::{Task, TaskId, TaskResult, WorkerId};
pub use worker::{
    NoopObserver, PoolConfig, PoolObserver, PoolStats, PoolStatus, TracingObserver, WorkerPool,
    WorkerPoolBuilder,
};

/// Common imports
pub mod prelude {
    pub use crate::cancel::{CancelCause, CancellationToken};
    pub use crate::collector::{wait_all, BatchOutcome, TaskFuture};
    pub use crate::error::{EngineError, ErrorKind};
    pub use crate::merge::{fan_in, fan_out, fan_out_indexed, reordered, Reorder};
    pub use crate::pipeline::{Pipeline, Stage};
    pub use crate::queue::OnFullPolicy;
    pub use crate::task::{Task, TaskId, TaskResult};
    pub use crate::worker::{PoolConfig, WorkerPool};
}
