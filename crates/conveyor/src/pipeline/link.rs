//! Publishers that connect a stage to the next one or to the collector

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cancel::{CancelCause, CancellationToken};
use crate::collector::ResultCollector;
use crate::error::EngineError;
use crate::port::{FailureSink, Inlet, Publish};
use crate::task::{Task, TaskId, TaskResult, WorkerId};

/// Feeds successful outputs of one stage into the next stage's queue
///
/// Errors skip the remaining stages and go straight to the failure sink.
pub(crate) struct StageLink<T> {
    next: Arc<dyn Inlet<T>>,
    failures: Arc<dyn FailureSink>,
}

impl<T> StageLink<T> {
    pub(crate) fn new(next: Arc<dyn Inlet<T>>, failures: Arc<dyn FailureSink>) -> Self {
        Self { next, failures }
    }
}

#[async_trait]
impl<T: Send + 'static> Publish<T> for StageLink<T> {
    async fn publish(&self, result: TaskResult<T>) {
        let (task_id, outcome, worker) = result.into_parts();
        match outcome {
            Ok(value) => {
                // Blocks while the next stage is full.
                if let Err(err) = self.next.offer(Task::with_id(task_id, value)).await {
                    let err = match err {
                        EngineError::QueueClosed => EngineError::PoolClosed,
                        other => other,
                    };
                    self.failures.reject(task_id, err, worker);
                }
            }
            Err(err) => self.failures.reject(task_id, err, worker),
        }
    }

    fn close(&self) {
        self.next.close_input();
    }
}

/// Output of the last stage
pub(crate) struct Sink<T> {
    collector: Arc<ResultCollector<T>>,
    failures: Arc<dyn FailureSink>,
}

impl<T> Sink<T> {
    pub(crate) fn new(collector: Arc<ResultCollector<T>>, failures: Arc<dyn FailureSink>) -> Self {
        Self {
            collector,
            failures,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Publish<T> for Sink<T> {
    async fn publish(&self, result: TaskResult<T>) {
        if result.is_ok() {
            self.collector.resolve(result);
            return;
        }
        let (task_id, outcome, worker) = result.into_parts();
        if let Err(err) = outcome {
            self.failures.reject(task_id, err, worker);
        }
    }

    // Upstream stages may still be failing tasks into the collector, so the
    // pipeline closes it after every stage has been joined.
    fn close(&self) {}
}

/// Fires [`CancelCause::UpstreamFailure`] on the first handler failure
pub(crate) struct FailFast {
    inner: Arc<dyn FailureSink>,
    token: CancellationToken,
}

impl FailFast {
    pub(crate) fn new(inner: Arc<dyn FailureSink>, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl FailureSink for FailFast {
    fn reject(&self, task_id: TaskId, error: EngineError, worker: Option<WorkerId>) {
        let handler_failed = matches!(
            error,
            EngineError::Handler(_) | EngineError::HandlerPanic(_)
        );
        if handler_failed && self.token.fire(CancelCause::UpstreamFailure) {
            debug!(%task_id, error = %error, "Stage failure cancels pipeline");
        }
        self.inner.reject(task_id, error, worker);
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::error::Result;

    #[derive(Default)]
    struct RecordingInlet {
        offered: Mutex<Vec<(TaskId, u32)>>,
        refuse_with: Option<EngineError>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl Inlet<u32> for RecordingInlet {
        async fn offer(&self, task: Task<u32>) -> Result<()> {
            if let Some(err) = &self.refuse_with {
                return Err(err.clone());
            }
            self.offered.lock().push((task.id(), task.into_payload()));
            Ok(())
        }

        fn close_input(&self) -> bool {
            let mut closed = self.closed.lock();
            let first = !*closed;
            *closed = true;
            first
        }
    }

    #[tokio::test]
    async fn test_link_forwards_value_with_same_id() {
        let inlet = Arc::new(RecordingInlet::default());
        let collector = Arc::new(ResultCollector::<u32>::new());
        let link = StageLink::new(inlet.clone(), collector.clone());

        let id = TaskId::new();
        link.publish(TaskResult::from_outcome(id, Ok(5), None)).await;
        assert_eq!(*inlet.offered.lock(), vec![(id, 5)]);

        link.close();
        assert!(*inlet.closed.lock());
    }

    #[tokio::test]
    async fn test_link_short_circuits_errors() {
        let inlet = Arc::new(RecordingInlet::default());
        let collector = Arc::new(ResultCollector::<u32>::new());
        let link = StageLink::new(inlet.clone(), collector.clone());

        let id = TaskId::new();
        let future = collector.register(id).unwrap();
        link.publish(TaskResult::failed(id, EngineError::Handler("bad".into()), None))
            .await;

        assert!(inlet.offered.lock().is_empty());
        assert_eq!(
            future.await.into_outcome(),
            Err(EngineError::Handler("bad".into()))
        );
    }

    #[tokio::test]
    async fn test_link_maps_closed_next_stage() {
        let inlet = Arc::new(RecordingInlet {
            refuse_with: Some(EngineError::QueueClosed),
            ..Default::default()
        });
        let collector = Arc::new(ResultCollector::<u32>::new());
        let link = StageLink::new(inlet, collector.clone());

        let id = TaskId::new();
        let future = collector.register(id).unwrap();
        link.publish(TaskResult::from_outcome(id, Ok(1), None)).await;
        assert_eq!(future.await.into_outcome(), Err(EngineError::PoolClosed));
    }

    #[test]
    fn test_fail_fast_fires_only_on_handler_errors() {
        let collector = Arc::new(ResultCollector::<u32>::new());
        let token = CancellationToken::new();
        let sink = FailFast::new(collector, token.clone());

        sink.reject(
            TaskId::new(),
            EngineError::Cancelled(CancelCause::UserCancel),
            None,
        );
        assert!(!token.is_fired());

        sink.reject(TaskId::new(), EngineError::HandlerPanic("boom".into()), None);
        assert_eq!(token.cause(), Some(CancelCause::UpstreamFailure));
    }
}
