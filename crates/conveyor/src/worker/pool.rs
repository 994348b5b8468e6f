//! Worker pool for task execution
//!
//! A fixed number of workers pull from one bounded queue and apply a single
//! handler. Every submission returns a [`TaskFuture`] that resolves exactly
//! once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::observer::{NoopObserver, PoolObserver};
use super::runtime::{Handler, PoolRuntime, RuntimeParts};
use super::state::{PoolStats, PoolStatus};
use crate::cancel::{CancelCause, CancellationToken};
use crate::collector::{CollectorStats, ResultCollector, TaskFuture};
use crate::error::{EngineError, Result};
use crate::queue::{BoundedQueue, OnFullPolicy};
use crate::task::Task;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used in logs and worker ids
    pub name: String,

    /// Number of concurrent workers
    pub worker_count: usize,

    /// Capacity of the input queue
    pub queue_capacity: usize,

    /// Behavior when the queue is full
    pub on_full: OnFullPolicy,

    /// Grace period used by [`WorkerPool::stop`]
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            worker_count: 4,
            queue_capacity: 64,
            on_full: OnFullPolicy::Block,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a named configuration with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load overrides from environment variables
    ///
    /// Environment variables:
    /// - `CONVEYOR_WORKERS`: worker count (default: 4)
    /// - `CONVEYOR_QUEUE_CAPACITY`: queue capacity (default: 64)
    /// - `CONVEYOR_ON_FULL`: `block` or `reject` (default: block)
    /// - `CONVEYOR_SHUTDOWN_TIMEOUT_MS`: stop grace period (default: 30000)
    ///
    /// Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_count = std::env::var("CONVEYOR_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.worker_count);

        let queue_capacity = std::env::var("CONVEYOR_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.queue_capacity);

        let on_full = std::env::var("CONVEYOR_ON_FULL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.on_full);

        let shutdown_timeout = std::env::var("CONVEYOR_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);

        Self {
            worker_count,
            queue_capacity,
            on_full,
            shutdown_timeout,
            ..defaults
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker count
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the full-queue policy
    pub fn with_on_full(mut self, policy: OnFullPolicy) -> Self {
        self.on_full = policy;
        self
    }

    /// Set the stop grace period
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidConfig("pool name must not be empty".into()));
        }
        if self.worker_count == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`WorkerPool`]
pub struct WorkerPoolBuilder<I, O> {
    config: PoolConfig,
    handler: Handler<I, O>,
    token: Option<CancellationToken>,
    observer: Arc<dyn PoolObserver>,
}

impl<I, O> WorkerPoolBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Share an existing cancellation token
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Receive per-task events
    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Result<WorkerPool<I, O>> {
        self.config.validate()?;

        let token = self.token.unwrap_or_default();
        let collector = Arc::new(ResultCollector::new());
        let queue = BoundedQueue::new(
            self.config.queue_capacity,
            self.config.on_full,
            token.clone(),
        )?;
        let runtime = PoolRuntime::new(RuntimeParts {
            name: Arc::from(self.config.name.as_str()),
            worker_count: self.config.worker_count,
            queue,
            handler: self.handler,
            output: collector.clone(),
            failures: collector.clone(),
            observer: self.observer,
            token,
        });

        Ok(WorkerPool {
            config: self.config,
            runtime,
            collector,
        })
    }
}

/// Fixed-size pool of workers sharing one bounded queue
///
/// # Example
///
/// ```no_run
/// use conveyor_engine::{PoolConfig, WorkerPool};
///
/// # async fn run() -> conveyor_engine::Result<()> {
/// let pool = WorkerPool::new(PoolConfig::new("square").with_worker_count(3), |task| async move {
///     let n: u64 = task.into_payload();
///     anyhow::Ok(n * n)
/// })?;
/// pool.start()?;
///
/// let result = pool.submit(7).await?.await;
/// assert_eq!(result.value(), Some(&49));
///
/// pool.shutdown(std::time::Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool<I, O> {
    config: PoolConfig,
    runtime: PoolRuntime<I, O>,
    collector: Arc<ResultCollector<O>>,
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a pool with a fresh cancellation token and no observer
    pub fn new<F, Fut>(config: PoolConfig, handler: F) -> Result<Self>
    where
        F: Fn(Task<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self::builder(config, handler).build()
    }

    pub fn builder<F, Fut>(config: PoolConfig, handler: F) -> WorkerPoolBuilder<I, O>
    where
        F: Fn(Task<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let handler: Handler<I, O> = Arc::new(move |task| handler(task).boxed());
        WorkerPoolBuilder {
            config,
            handler,
            token: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Launch the workers
    ///
    /// Tasks submitted before `start` wait in the queue.
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub fn start(&self) -> Result<()> {
        self.runtime.start()
    }

    /// Submit a payload under a fresh task id
    pub async fn submit(&self, payload: I) -> Result<TaskFuture<O>> {
        self.submit_task(Task::new(payload)).await
    }

    /// Submit a task with a caller-chosen id
    ///
    /// Suspends while the queue is full under [`OnFullPolicy::Block`].
    pub async fn submit_task(&self, task: Task<I>) -> Result<TaskFuture<O>> {
        let task_id = task.id();
        let future = self.collector.register(task_id)?;
        let admission = self.collector.admission(task_id);
        self.runtime
            .offer(task)
            .await
            .map_err(EngineError::into_submit_error)?;
        admission.admitted();
        Ok(future)
    }

    /// Stop accepting tasks and wait up to `grace` for the queue to drain
    ///
    /// When the grace period elapses the workers are aborted, every
    /// unresolved task is reported as `Timeout` and `Err(Timeout)` is
    /// returned, here and on every later call.
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        match self.runtime.status() {
            PoolStatus::Stopped if self.runtime.is_aborted() => return Err(EngineError::Timeout),
            PoolStatus::Stopped => return Ok(()),
            PoolStatus::Idle if self.runtime.stop_idle() => {
                info!(pool = %self.config.name, "Idle pool closed");
                return Ok(());
            }
            _ => {}
        }

        info!(pool = %self.config.name, grace_ms = grace.as_millis() as u64, "Initiating graceful shutdown");
        self.runtime.close_input();

        if tokio::time::timeout(grace, self.runtime.join()).await.is_ok() {
            return Ok(());
        }

        let stats = self.runtime.stats();
        warn!(
            pool = %self.config.name,
            in_flight = stats.in_flight,
            outstanding = stats.outstanding,
            "Shutdown grace period elapsed, abandoning tasks"
        );
        self.runtime.abort();
        self.collector.abandon(EngineError::Timeout);
        self.runtime.token().fire(CancelCause::Timeout);
        Err(EngineError::Timeout)
    }

    /// Cancel with [`CancelCause::UserCancel`] and shut down within the
    /// configured `shutdown_timeout`
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn stop(&self) -> Result<()> {
        self.cancel(CancelCause::UserCancel);
        self.shutdown(self.config.shutdown_timeout).await
    }

    /// Fire the pool's token
    ///
    /// Queued tasks resolve as `Cancelled`; running handlers finish and
    /// deliver their real outcome. Returns `true` if this call fired it.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        self.runtime.cancel(cause)
    }

    pub fn token(&self) -> &CancellationToken {
        self.runtime.token()
    }

    pub fn status(&self) -> PoolStatus {
        self.runtime.status()
    }

    pub fn stats(&self) -> PoolStats {
        self.runtime.stats()
    }

    pub fn collector_stats(&self) -> CollectorStats {
        self.collector.stats()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
