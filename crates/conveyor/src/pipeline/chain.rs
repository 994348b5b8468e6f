//! Pipeline assembly and lifecycle

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::link::{FailFast, Sink, StageLink};
use super::stage::Stage;
use crate::cancel::{CancelCause, CancellationToken};
use crate::collector::{CollectorStats, ResultCollector, TaskFuture};
use crate::error::{EngineError, Result};
use crate::port::{FailureSink, Inlet, Publish, StageControl};
use crate::queue::{BoundedQueue, OnFullPolicy};
use crate::task::Task;
use crate::worker::runtime::{PoolRuntime, RuntimeParts};
use crate::worker::{NoopObserver, PoolObserver, PoolStats, PoolStatus};

/// Shared state while stages are wired together, last stage first
struct Assembly {
    token: CancellationToken,
    failures: Arc<dyn FailureSink>,
    observer: Arc<dyn PoolObserver>,
    entry_policy: OnFullPolicy,
    stages: Vec<Arc<dyn StageControl>>,
}

impl Assembly {
    fn spawn_stage<I, O>(
        &mut self,
        stage: Stage<I, O>,
        policy: OnFullPolicy,
        output: Arc<dyn Publish<O>>,
    ) -> Result<Arc<dyn Inlet<I>>>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        stage.config.validate()?;
        let queue = BoundedQueue::new(stage.config.input_capacity, policy, self.token.clone())?;
        let runtime = Arc::new(PoolRuntime::new(RuntimeParts {
            name: Arc::from(stage.config.name.as_str()),
            worker_count: stage.config.concurrency,
            queue,
            handler: stage.handler,
            output,
            failures: Arc::clone(&self.failures),
            observer: Arc::clone(&self.observer),
            token: self.token.clone(),
        }));
        self.stages.push(runtime.clone());
        Ok(runtime)
    }
}

type Assemble<I, O> =
    Box<dyn FnOnce(&mut Assembly, Arc<dyn Publish<O>>) -> Result<Arc<dyn Inlet<I>>> + Send>;

struct Options {
    token: Option<CancellationToken>,
    observer: Arc<dyn PoolObserver>,
    on_full: OnFullPolicy,
    fail_fast: bool,
}

/// Type-checked pipeline builder
///
/// Each `then` stage must take the previous stage's output type as input.
pub struct PipelineBuilder<I, O> {
    options: Options,
    stage_count: usize,
    assemble: Assemble<I, O>,
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Append a stage
    pub fn then<P>(self, stage: Stage<O, P>) -> PipelineBuilder<I, P>
    where
        P: Send + 'static,
    {
        let upstream = self.assemble;
        PipelineBuilder {
            options: self.options,
            stage_count: self.stage_count + 1,
            assemble: Box::new(move |asm: &mut Assembly, output: Arc<dyn Publish<P>>| {
                // Inter-stage queues always block so backpressure reaches the submitter.
                let next = asm.spawn_stage(stage, OnFullPolicy::Block, output)?;
                let link: Arc<dyn Publish<O>> =
                    Arc::new(StageLink::new(next, Arc::clone(&asm.failures)));
                upstream(asm, link)
            }),
        }
    }

    /// Share an existing cancellation token across all stages
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.options.token = Some(token);
        self
    }

    /// Receive per-task events from every stage
    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.options.observer = observer;
        self
    }

    /// Full-queue policy of the first stage (later stages always block)
    pub fn on_full(mut self, policy: OnFullPolicy) -> Self {
        self.options.on_full = policy;
        self
    }

    /// Cancel the whole pipeline on the first handler failure
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.options.fail_fast = enabled;
        self
    }

    /// Wire and start every stage; must run inside a tokio runtime
    pub fn build(self) -> Result<Pipeline<I, O>> {
        let token = self.options.token.unwrap_or_default();
        let collector = Arc::new(ResultCollector::new());
        let failures: Arc<dyn FailureSink> = if self.options.fail_fast {
            Arc::new(FailFast::new(collector.clone(), token.clone()))
        } else {
            collector.clone()
        };

        let mut asm = Assembly {
            token: token.clone(),
            failures: Arc::clone(&failures),
            observer: self.options.observer,
            entry_policy: self.options.on_full,
            stages: Vec::with_capacity(self.stage_count),
        };
        let sink: Arc<dyn Publish<O>> = Arc::new(Sink::new(collector.clone(), failures));
        let entry = (self.assemble)(&mut asm, sink)?;
        asm.stages.reverse();

        for stage in &asm.stages {
            stage.start()?;
        }

        let pipeline = Pipeline {
            entry,
            stages: asm.stages,
            collector,
            token,
        };
        info!(stages = ?pipeline.stage_names(), "Pipeline started");
        Ok(pipeline)
    }
}

/// Linear chain of worker pools with end-to-end backpressure
///
/// Stage outputs become the next stage's input under the same task id; an
/// error at any stage skips the rest and resolves the task's future
/// directly. All stages share one cancellation token.
///
/// # Example
///
/// ```no_run
/// use conveyor_engine::{Pipeline, Stage};
///
/// # async fn run() -> conveyor_engine::Result<()> {
/// let pipeline = Pipeline::builder(Stage::new("parse", 2, 16, |line: String| async move {
///         anyhow::Ok(line.trim().parse::<i64>()?)
///     }))
///     .then(Stage::new("square", 4, 16, |n: i64| async move { anyhow::Ok(n * n) }))
///     .build()?;
///
/// let result = pipeline.submit(" 12 ".to_string()).await?.await;
/// assert_eq!(result.value(), Some(&144));
/// pipeline.close_and_wait().await;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<I, O> {
    entry: Arc<dyn Inlet<I>>,
    stages: Vec<Arc<dyn StageControl>>,
    collector: Arc<ResultCollector<O>>,
    token: CancellationToken,
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Start a builder with the first stage
    pub fn builder(first: Stage<I, O>) -> PipelineBuilder<I, O> {
        PipelineBuilder {
            options: Options {
                token: None,
                observer: Arc::new(NoopObserver),
                on_full: OnFullPolicy::Block,
                fail_fast: false,
            },
            stage_count: 1,
            assemble: Box::new(move |asm: &mut Assembly, output: Arc<dyn Publish<O>>| {
                let policy = asm.entry_policy;
                asm.spawn_stage(first, policy, output)
            }),
        }
    }

    /// Submit a payload under a fresh task id
    pub async fn submit(&self, payload: I) -> Result<TaskFuture<O>> {
        self.submit_task(Task::new(payload)).await
    }

    /// Submit a task with a caller-chosen id
    pub async fn submit_task(&self, task: Task<I>) -> Result<TaskFuture<O>> {
        let task_id = task.id();
        let future = self.collector.register(task_id)?;
        let admission = self.collector.admission(task_id);
        self.entry
            .offer(task)
            .await
            .map_err(EngineError::into_submit_error)?;
        admission.admitted();
        Ok(future)
    }

    /// Close the first stage and wait until every stage has drained
    #[instrument(skip(self))]
    pub async fn close_and_wait(&self) {
        self.entry.close_input();
        for stage in &self.stages {
            stage.join().await;
        }
        self.collector.close();
        info!("Pipeline drained");
    }

    /// Graceful close bounded by `grace`
    ///
    /// On expiry every stage is aborted, unresolved tasks are reported as
    /// `Timeout` and `Err(Timeout)` is returned, here and on every later
    /// call.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if self.stages.iter().any(|stage| stage.is_aborted()) {
            return Err(EngineError::Timeout);
        }
        if tokio::time::timeout(grace, self.close_and_wait()).await.is_ok() {
            return Ok(());
        }

        warn!(
            grace_ms = grace.as_millis() as u64,
            pending = self.collector.pending(),
            "Pipeline shutdown grace period elapsed, abandoning tasks"
        );
        for stage in &self.stages {
            stage.abort();
        }
        self.collector.abandon(EngineError::Timeout);
        self.token.fire(CancelCause::Timeout);
        Err(EngineError::Timeout)
    }

    /// Fire the shared token; returns `true` if this call fired it
    pub fn cancel(&self, cause: CancelCause) -> bool {
        self.token.fire(cause)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stage names in pipeline order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Counters of each stage in pipeline order
    pub fn stage_stats(&self) -> Vec<PoolStats> {
        self.stages.iter().map(|stage| stage.stats()).collect()
    }

    /// Lifecycle status of each stage in pipeline order
    pub fn stage_statuses(&self) -> Vec<PoolStatus> {
        self.stages.iter().map(|stage| stage.status()).collect()
    }

    pub fn collector_stats(&self) -> CollectorStats {
        self.collector.stats()
    }
}

impl<I, O> Drop for Pipeline<I, O> {
    fn drop(&mut self) {
        self.entry.close_input();
    }
}
