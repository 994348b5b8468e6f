//! Task and result records

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Opaque task identifier (UUID v7, sortable by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new task id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of submitted work
///
/// Fields are read-only once constructed; a task is moved into exactly one
/// worker and consumed there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task<P> {
    id: TaskId,
    payload: P,
    enqueued_at: DateTime<Utc>,
}

impl<P> Task<P> {
    /// Create a task with a fresh id
    pub fn new(payload: P) -> Self {
        Self::with_id(TaskId::new(), payload)
    }

    /// Create a task with a caller-chosen id
    pub fn with_id(id: TaskId, payload: P) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Consume the task, returning its payload
    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Identifies one execution unit: the owning pool's name plus the worker index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pool: Arc<str>,
    index: usize,
}

impl WorkerId {
    pub(crate) fn new(pool: Arc<str>, index: usize) -> Self {
        Self { pool, index }
    }

    /// Name of the pool (or pipeline stage) the worker belongs to
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Index of the worker within its pool
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.index)
    }
}

/// Outcome of a single task
///
/// Holds either a value or an error, never both. `worker_id` is `None` when
/// the engine resolved the task without running it (cancelled before start,
/// pool closed, abandoned at shutdown).
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    task_id: TaskId,
    outcome: Result<T, EngineError>,
    completed_at: DateTime<Utc>,
    worker_id: Option<WorkerId>,
}

impl<T> TaskResult<T> {
    pub(crate) fn from_outcome(
        task_id: TaskId,
        outcome: Result<T, EngineError>,
        worker_id: Option<WorkerId>,
    ) -> Self {
        Self {
            task_id,
            outcome,
            completed_at: Utc::now(),
            worker_id,
        }
    }

    pub(crate) fn failed(task_id: TaskId, error: EngineError, worker_id: Option<WorkerId>) -> Self {
        Self::from_outcome(task_id, Err(error), worker_id)
    }

    pub(crate) fn into_parts(self) -> (TaskId, Result<T, EngineError>, Option<WorkerId>) {
        (self.task_id, self.outcome, self.worker_id)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }

    /// Success value, if the task succeeded
    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// Error, if the task failed
    pub fn error(&self) -> Option<&EngineError> {
        self.outcome.as_ref().err()
    }

    pub fn outcome(&self) -> &Result<T, EngineError> {
        &self.outcome
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// The worker that executed the task
    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.worker_id.as_ref()
    }

    pub fn into_outcome(self) -> Result<T, EngineError> {
        self.outcome
    }
}
