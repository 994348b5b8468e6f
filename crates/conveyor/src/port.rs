//! Internal seams between pools, pipeline links and the result collector
//!
//! Worker runtimes only know that finished tasks go *somewhere*: the
//! terminal collector for a standalone pool, or a link into the next stage
//! for a pipeline. These traits are object-safe so a pipeline can hold
//! stages of unrelated payload types in one list.

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::task::{Task, TaskId, TaskResult, WorkerId};
use crate::worker::{PoolStats, PoolStatus};

/// Destination for results produced by a pool's workers
#[async_trait]
pub(crate) trait Publish<T>: Send + Sync {
    /// Hand over a finished result; may suspend for downstream backpressure
    async fn publish(&self, result: TaskResult<T>);

    /// Called once after every worker of the producing pool has exited
    fn close(&self);
}

/// Entry point of a pool, used by the previous pipeline stage
#[async_trait]
pub(crate) trait Inlet<I>: Send + Sync {
    /// Admit a task into the pool's queue
    async fn offer(&self, task: Task<I>) -> Result<()>;

    /// Stop admitting tasks; returns `true` if this call closed the input
    fn close_input(&self) -> bool;
}

/// Terminal sink for tasks that leave the normal result path
///
/// Receives unstarted tasks resolved by a cancellation drain and, inside a
/// pipeline, errors that short-circuit the remaining stages.
pub(crate) trait FailureSink: Send + Sync {
    fn reject(&self, task_id: TaskId, error: EngineError, worker: Option<WorkerId>);
}

/// Type-erased lifecycle control of one running pool
#[async_trait]
pub(crate) trait StageControl: Send + Sync {
    fn name(&self) -> &str;

    /// Launch the workers
    fn start(&self) -> Result<()>;

    /// Wait until every worker has exited and the output is closed
    async fn join(&self);

    /// Abort workers without waiting for in-flight handlers
    fn abort(&self);

    fn stats(&self) -> PoolStats;

    fn status(&self) -> PoolStatus;

    /// Stopped by an abort, with tasks abandoned
    fn is_aborted(&self) -> bool;
}
