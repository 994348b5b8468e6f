//! Per-task event hooks
//!
//! Workers never log task failures themselves. Callers that want to see
//! handler errors, panics or cancellations plug in a [`PoolObserver`].

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cancel::CancelCause;
use crate::error::EngineError;
use crate::task::{TaskId, WorkerId};

/// Receives task lifecycle events from a pool's workers
///
/// Called inline on the worker, so implementations must not block.
pub trait PoolObserver: Send + Sync + 'static {
    /// A worker is about to invoke the handler
    fn on_task_started(&self, _worker: &WorkerId, _task_id: TaskId) {}

    /// The handler returned (or panicked); `error` is `None` on success
    fn on_task_finished(
        &self,
        _worker: &WorkerId,
        _task_id: TaskId,
        _error: Option<&EngineError>,
        _elapsed: Duration,
    ) {
    }

    /// The handler panicked; the worker keeps running
    fn on_handler_panic(&self, _worker: &WorkerId, _task_id: TaskId, _message: &str) {}

    /// A queued task was resolved without running
    fn on_task_cancelled(&self, _pool: &str, _task_id: TaskId, _cause: CancelCause) {}
}

/// Ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {}

/// Emits every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_task_started(&self, worker: &WorkerId, task_id: TaskId) {
        trace!(%worker, %task_id, "Task started");
    }

    fn on_task_finished(
        &self,
        worker: &WorkerId,
        task_id: TaskId,
        error: Option<&EngineError>,
        elapsed: Duration,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match error {
            None => debug!(%worker, %task_id, elapsed_ms, "Task completed"),
            Some(error) => warn!(
                %worker,
                %task_id,
                elapsed_ms,
                kind = %error.kind(),
                error = %error,
                "Task failed"
            ),
        }
    }

    fn on_handler_panic(&self, worker: &WorkerId, task_id: TaskId, message: &str) {
        warn!(%worker, %task_id, panic = message, "Handler panicked");
    }

    fn on_task_cancelled(&self, pool: &str, task_id: TaskId, cause: CancelCause) {
        debug!(pool, %task_id, %cause, "Task cancelled before start");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        finished: AtomicUsize,
    }

    impl PoolObserver for Counting {
        fn on_task_finished(
            &self,
            _worker: &WorkerId,
            _task_id: TaskId,
            _error: Option<&EngineError>,
            _elapsed: Duration,
        ) {
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_default_methods_are_optional() {
        let counting = Arc::new(Counting::default());
        let observer: Arc<dyn PoolObserver> = counting.clone();
        let worker = WorkerId::new(Arc::from("pool"), 0);
        let task_id = TaskId::new();

        observer.on_task_started(&worker, task_id);
        observer.on_handler_panic(&worker, task_id, "boom");
        observer.on_task_finished(&worker, task_id, None, Duration::ZERO);
        observer.on_task_cancelled("pool", task_id, CancelCause::UserCancel);
        assert_eq!(counting.finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracing_observer_accepts_all_events() {
        let observer = TracingObserver;
        let worker = WorkerId::new(Arc::from("pool"), 1);
        let task_id = TaskId::new();
        observer.on_task_started(&worker, task_id);
        observer.on_task_finished(
            &worker,
            task_id,
            Some(&EngineError::Handler("bad input".into())),
            Duration::from_millis(3),
        );
        NoopObserver.on_handler_panic(&worker, task_id, "ignored");
    }
}
