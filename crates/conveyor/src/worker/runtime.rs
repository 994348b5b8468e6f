//! Worker loop, admission and supervision shared by pools and pipeline stages

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::observer::PoolObserver;
use super::state::{PoolState, PoolStats, PoolStatus};
use crate::cancel::{CancelCause, CancellationToken};
use crate::error::{EngineError, Result};
use crate::port::{FailureSink, Inlet, Publish, StageControl};
use crate::queue::BoundedQueue;
use crate::task::{Task, TaskResult, WorkerId};

/// Type-erased task handler
pub(crate) type Handler<I, O> =
    Arc<dyn Fn(Task<I>) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

/// Everything a pool's workers share
pub(crate) struct PoolCore<I, O> {
    name: Arc<str>,
    queue: BoundedQueue<Task<I>>,
    state: PoolState,
    status: RwLock<PoolStatus>,
    handler: Handler<I, O>,
    output: Arc<dyn Publish<O>>,
    failures: Arc<dyn FailureSink>,
    observer: Arc<dyn PoolObserver>,
    token: CancellationToken,
}

/// Runs the paired decrement on drop, so aborted workers still release
struct Gauge<'a>(&'a PoolState, fn(&PoolState));

impl Gauge<'_> {
    /// Hand the count over to whoever resolves the task
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        (self.1)(self.0)
    }
}

impl<I, O> PoolCore<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn status(&self) -> PoolStatus {
        match *self.status.read() {
            PoolStatus::Running if self.state.is_shutdown() || self.token.is_fired() => {
                PoolStatus::Draining
            }
            status => status,
        }
    }

    fn stats(&self) -> PoolStats {
        self.state.snapshot(&self.name, self.queue.len())
    }

    async fn run_worker(self: Arc<Self>, index: usize) {
        let worker = WorkerId::new(Arc::clone(&self.name), index);
        self.state.worker_started();
        let _alive = Gauge(&self.state, PoolState::worker_exited);
        debug!(pool = %self.name, worker = index, "Worker started");

        while let Some(task) = self.queue.take().await {
            match self.token.error() {
                // Taken in the same turn cancellation fired: never started.
                Some(err) => self.resolve_unstarted(task, err),
                None => self.execute(&worker, task).await,
            }
        }

        debug!(pool = %self.name, worker = index, "Worker exited");
    }

    async fn execute(&self, worker: &WorkerId, task: Task<I>) {
        let task_id = task.id();
        self.observer.on_task_started(worker, task_id);
        let started = Instant::now();

        let outcome = {
            self.state.invocation_started();
            let _running = Gauge(&self.state, PoolState::invocation_finished);
            let handler = Arc::clone(&self.handler);
            match AssertUnwindSafe(async move { handler(task).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(EngineError::from_handler(err)),
                Err(payload) => {
                    let err = EngineError::from_panic(payload);
                    if let EngineError::HandlerPanic(message) = &err {
                        self.observer.on_handler_panic(worker, task_id, message);
                    }
                    Err(err)
                }
            }
        };

        self.observer
            .on_task_finished(worker, task_id, outcome.as_ref().err(), started.elapsed());
        self.output
            .publish(TaskResult::from_outcome(
                task_id,
                outcome,
                Some(worker.clone()),
            ))
            .await;
        self.state.task_resolved();
    }

    fn resolve_unstarted(&self, task: Task<I>, error: EngineError) {
        let task_id = task.id();
        if let EngineError::Cancelled(cause) = &error {
            self.observer.on_task_cancelled(&self.name, task_id, *cause);
        }
        self.failures.reject(task_id, error, None);
        self.state.task_resolved();
    }

    /// Resolve every buffered task with `error` without running it
    fn drain_with(&self, error: EngineError) -> usize {
        let mut drained = 0;
        while let Some(task) = self.queue.try_take() {
            self.resolve_unstarted(task, error.clone());
            drained += 1;
        }
        if drained > 0 {
            debug!(pool = %self.name, drained, error = %error, "Drained unstarted tasks");
        }
        drained
    }

    /// Drain with the cancellation error, if the token has fired
    fn drain(&self) -> usize {
        match self.token.error() {
            Some(err) => self.drain_with(err),
            None => 0,
        }
    }

    async fn offer(&self, task: Task<I>) -> Result<()> {
        if self.state.is_shutdown() {
            return Err(EngineError::PoolClosed);
        }
        if let Some(err) = self.token.error() {
            return Err(err);
        }

        self.state.task_admitted();
        // Released if the put fails or the caller drops this future.
        let admitted = Gauge(&self.state, PoolState::task_resolved);
        self.queue.put(task).await?;
        admitted.disarm();

        // The put may have landed after the supervisor's cancellation drain.
        if self.token.is_fired() {
            self.drain();
        }
        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut workers: JoinSet<()>, done: watch::Sender<bool>) {
        let mut drained = false;
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Err(err)) if err.is_panic() => {
                        warn!(pool = %self.name, error = %err, "Worker task panicked");
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = self.token.cancelled(), if !drained => {
                    drained = true;
                    self.drain();
                }
            }
        }

        self.drain();
        self.finish(&done);
    }

    fn finish(&self, done: &watch::Sender<bool>) {
        self.output.close();
        *self.status.write() = PoolStatus::Stopped;
        done.send_replace(true);
        info!(pool = %self.name, "Pool stopped");
    }
}

/// Construction inputs for a [`PoolRuntime`]
pub(crate) struct RuntimeParts<I, O> {
    pub name: Arc<str>,
    pub worker_count: usize,
    pub queue: BoundedQueue<Task<I>>,
    pub handler: Handler<I, O>,
    pub output: Arc<dyn Publish<O>>,
    pub failures: Arc<dyn FailureSink>,
    pub observer: Arc<dyn PoolObserver>,
    pub token: CancellationToken,
}

/// A pool's workers plus the handles needed to start, join and abort them
pub(crate) struct PoolRuntime<I, O> {
    core: Arc<PoolCore<I, O>>,
    worker_count: usize,
    launch: Mutex<Option<watch::Sender<bool>>>,
    done: watch::Receiver<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    aborted: AtomicBool,
}

impl<I, O> PoolRuntime<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(parts: RuntimeParts<I, O>) -> Self {
        let (launch, done) = watch::channel(false);
        let core = PoolCore {
            name: parts.name,
            queue: parts.queue,
            state: PoolState::new(),
            status: RwLock::new(PoolStatus::Idle),
            handler: parts.handler,
            output: parts.output,
            failures: parts.failures,
            observer: parts.observer,
            token: parts.token,
        };
        Self {
            core: Arc::new(core),
            worker_count: parts.worker_count.max(1),
            launch: Mutex::new(Some(launch)),
            done,
            supervisor: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.core.name
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.core.token
    }

    pub(crate) fn status(&self) -> PoolStatus {
        self.core.status()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.core.stats()
    }

    /// Spawn the workers and their supervisor; must run inside a tokio runtime
    pub(crate) fn start(&self) -> Result<()> {
        if self.core.state.is_shutdown() {
            return Err(EngineError::PoolClosed);
        }
        let Some(done) = self.launch.lock().take() else {
            return Err(EngineError::AlreadyRunning);
        };

        *self.core.status.write() = PoolStatus::Running;
        let mut workers = JoinSet::new();
        for index in 0..self.worker_count {
            workers.spawn(Arc::clone(&self.core).run_worker(index));
        }

        info!(
            pool = %self.core.name,
            workers = self.worker_count,
            capacity = self.core.queue.capacity(),
            policy = %self.core.queue.policy(),
            "Pool started"
        );

        let handle = tokio::spawn(Arc::clone(&self.core).supervise(workers, done));
        *self.supervisor.lock() = Some(handle);
        Ok(())
    }

    pub(crate) async fn offer(&self, task: Task<I>) -> Result<()> {
        self.core.offer(task).await
    }

    pub(crate) fn close_input(&self) -> bool {
        let first = self.core.state.begin_shutdown();
        self.core.queue.close();
        if first {
            debug!(pool = %self.core.name, queued = self.core.queue.len(), "Input closed");
        }
        first
    }

    /// Fire the shared token and resolve queued tasks right away
    pub(crate) fn cancel(&self, cause: CancelCause) -> bool {
        let fired = self.core.token.fire(cause);
        self.core.drain();
        fired
    }

    /// Stop a pool that was never started
    ///
    /// Returns `false` if the pool was already started or stopped.
    pub(crate) fn stop_idle(&self) -> bool {
        let Some(done) = self.launch.lock().take() else {
            return false;
        };
        self.close_input();
        let error = self.core.token.error().unwrap_or(EngineError::PoolClosed);
        self.core.drain_with(error);
        self.core.finish(&done);
        true
    }

    pub(crate) async fn join(&self) {
        let mut done = self.done.clone();
        // A dropped sender means the supervisor was aborted.
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.launch.lock().take();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        *self.core.status.write() = PoolStatus::Stopped;
        warn!(
            pool = %self.core.name,
            in_flight = self.core.state.in_flight(),
            queued = self.core.queue.len(),
            "Pool aborted"
        );
    }

    /// Whether the pool was stopped by [`abort`](Self::abort) rather than draining
    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

impl<I, O> Drop for PoolRuntime<I, O> {
    fn drop(&mut self) {
        // Lets workers finish the buffer and exit instead of waiting forever.
        self.core.queue.close();
    }
}

#[async_trait]
impl<I, O> Inlet<I> for PoolRuntime<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn offer(&self, task: Task<I>) -> Result<()> {
        PoolRuntime::offer(self, task).await
    }

    fn close_input(&self) -> bool {
        PoolRuntime::close_input(self)
    }
}

#[async_trait]
impl<I, O> StageControl for PoolRuntime<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        PoolRuntime::name(self)
    }

    fn start(&self) -> Result<()> {
        PoolRuntime::start(self)
    }

    async fn join(&self) {
        PoolRuntime::join(self).await
    }

    fn abort(&self) {
        PoolRuntime::abort(self)
    }

    fn stats(&self) -> PoolStats {
        PoolRuntime::stats(self)
    }

    fn status(&self) -> PoolStatus {
        PoolRuntime::status(self)
    }

    fn is_aborted(&self) -> bool {
        PoolRuntime::is_aborted(self)
    }
}
