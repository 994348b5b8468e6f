//! Result collection
//!
//! Every admitted task gets a [`TaskFuture`] backed by a one-shot channel
//! registered in a [`ResultCollector`]. Workers, cancellation drains and
//! pipeline short-circuits all resolve through the collector, so a task's
//! future completes exactly once no matter which path finishes it.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{EngineError, ErrorKind, Result};
use crate::port::{FailureSink, Publish};
use crate::task::{TaskId, TaskResult, WorkerId};

/// Counters kept by a [`ResultCollector`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStats {
    /// Futures registered but not yet resolved
    pub pending: usize,
    pub resolved: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Registry of pending task futures
pub struct ResultCollector<T> {
    pending: DashMap<TaskId, oneshot::Sender<TaskResult<T>>>,
    closed: AtomicBool,
    resolved: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl<T> Default for ResultCollector<T> {
    fn default() -> Self {
        Self {
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            resolved: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

impl<T> ResultCollector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a future for `task_id`
    ///
    /// Fails with `DuplicateTask` while a task with the same id is pending,
    /// and with `PoolClosed` once the collector is closed.
    pub fn register(&self, task_id: TaskId) -> Result<TaskFuture<T>> {
        if self.is_closed() {
            return Err(EngineError::PoolClosed);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(task_id) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateTask(task_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // close() may have swept the map between the check and the insert.
        if self.is_closed() {
            self.pending.remove(&task_id);
            return Err(EngineError::PoolClosed);
        }

        Ok(TaskFuture { task_id, rx })
    }

    /// Drop the registration of a task that was never admitted
    pub fn withdraw(&self, task_id: TaskId) -> bool {
        self.pending.remove(&task_id).is_some()
    }

    /// Withdraws `task_id` on drop unless marked admitted
    pub(crate) fn admission(&self, task_id: TaskId) -> Admission<'_, T> {
        Admission {
            collector: self,
            task_id,
            admitted: false,
        }
    }

    /// Deliver a result to its future
    ///
    /// Returns `false` if nothing is waiting for that id (already resolved or
    /// never registered).
    pub fn resolve(&self, result: TaskResult<T>) -> bool {
        let Some((_, tx)) = self.pending.remove(&result.task_id()) else {
            trace!(task_id = %result.task_id(), "No pending future for result");
            return false;
        };

        self.resolved.fetch_add(1, Ordering::Relaxed);
        if result.is_ok() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        // The receiver may have been dropped; the result is discarded then.
        let _ = tx.send(result);
        true
    }

    /// Refuse new registrations and resolve leftovers with `PoolClosed`
    pub fn close(&self) -> usize {
        self.abandon(EngineError::PoolClosed)
    }

    /// Refuse new registrations and resolve leftovers with `error`
    pub fn abandon(&self, error: EngineError) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<TaskId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut abandoned = 0;
        for task_id in ids {
            if self.resolve(TaskResult::failed(task_id, error.clone(), None)) {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            debug!(abandoned, error = %error, "Resolved leftover tasks");
        }
        abandoned
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            pending: self.pending.len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Registration guard for a submission in progress
pub(crate) struct Admission<'a, T> {
    collector: &'a ResultCollector<T>,
    task_id: TaskId,
    admitted: bool,
}

impl<T> Admission<'_, T> {
    pub(crate) fn admitted(mut self) {
        self.admitted = true;
    }
}

impl<T> Drop for Admission<'_, T> {
    fn drop(&mut self) {
        if !self.admitted {
            self.collector.withdraw(self.task_id);
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Publish<T> for ResultCollector<T> {
    async fn publish(&self, result: TaskResult<T>) {
        self.resolve(result);
    }

    fn close(&self) {
        ResultCollector::close(self);
    }
}

impl<T: Send + 'static> FailureSink for ResultCollector<T> {
    fn reject(&self, task_id: TaskId, error: EngineError, worker: Option<WorkerId>) {
        self.resolve(TaskResult::failed(task_id, error, worker));
    }
}

/// Completes with the task's [`TaskResult`]
///
/// Resolves to `PoolClosed` if the owning pool went away without
/// resolving the task.
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct TaskFuture<T> {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskResult<T>>,
}

impl<T> TaskFuture<T> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Await the result
    pub async fn wait(self) -> TaskResult<T> {
        self.await
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = TaskResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.task_id;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(TaskResult::failed(
                task_id,
                EngineError::PoolClosed,
                None,
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Every result of a batch plus the first failure in input order
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub results: Vec<TaskResult<T>>,
    pub first_error: Option<EngineError>,
}

impl<T> BatchOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Failed results, in input order
    pub fn failures(&self) -> impl Iterator<Item = &TaskResult<T>> {
        self.results.iter().filter(|r| r.is_err())
    }

    /// Successful values, in input order
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(TaskResult::value)
    }

    /// Number of failures per error kind
    pub fn error_summary(&self) -> BTreeMap<ErrorKind, usize> {
        let mut summary = BTreeMap::new();
        for error in self.results.iter().filter_map(TaskResult::error) {
            *summary.entry(error.kind()).or_insert(0) += 1;
        }
        summary
    }
}

/// Wait for every future, regardless of failures
pub async fn wait_all<T, F>(futures: F) -> BatchOutcome<T>
where
    F: IntoIterator<Item = TaskFuture<T>>,
{
    let results = futures::future::join_all(futures).await;
    let first_error = results.iter().find_map(|r| r.error().cloned());
    BatchOutcome {
        results,
        first_error,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cancel::CancelCause;

    #[tokio::test]
    async fn test_register_resolve() {
        let collector = ResultCollector::new();
        let id = TaskId::new();
        let future = collector.register(id).unwrap();
        assert_eq!(future.task_id(), id);
        assert_eq!(collector.pending(), 1);

        assert!(collector.resolve(TaskResult::from_outcome(id, Ok(7), None)));
        assert!(!collector.resolve(TaskResult::from_outcome(id, Ok(8), None)));

        let result = future.wait().await;
        assert_eq!(result.value(), Some(&7));
        assert_eq!(
            collector.stats(),
            CollectorStats {
                pending: 0,
                resolved: 1,
                succeeded: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let collector = ResultCollector::<()>::new();
        let id = TaskId::new();
        let _future = collector.register(id).unwrap();
        assert_eq!(
            collector.register(id).unwrap_err(),
            EngineError::DuplicateTask(id)
        );

        assert!(collector.withdraw(id));
        assert!(collector.register(id).is_ok());
    }

    #[tokio::test]
    async fn test_close_resolves_leftovers() {
        let collector = ResultCollector::<u32>::new();
        let future = collector.register(TaskId::new()).unwrap();

        assert_eq!(collector.close(), 1);
        assert_eq!(future.await.into_outcome(), Err(EngineError::PoolClosed));
        assert_eq!(
            collector.register(TaskId::new()).unwrap_err(),
            EngineError::PoolClosed
        );
    }

    #[tokio::test]
    async fn test_dropped_collector_resolves_pool_closed() {
        let collector = ResultCollector::<u32>::new();
        let future = collector.register(TaskId::new()).unwrap();
        drop(collector);
        assert_eq!(future.await.into_outcome(), Err(EngineError::PoolClosed));
    }

    #[tokio::test]
    async fn test_wait_all_reports_first_error_in_input_order() {
        let collector = Arc::new(ResultCollector::<u32>::new());
        let ids: Vec<TaskId> = (0..4).map(|_| TaskId::new()).collect();
        let futures: Vec<_> = ids
            .iter()
            .map(|id| collector.register(*id).unwrap())
            .collect();

        // resolved in reverse order; the earliest input failure must win
        collector.resolve(TaskResult::from_outcome(ids[3], Ok(3), None));
        collector.reject(ids[2], EngineError::Timeout, None);
        collector.reject(ids[1], EngineError::Handler("bad".into()), None);
        collector.resolve(TaskResult::from_outcome(ids[0], Ok(0), None));

        let batch = wait_all(futures).await;
        assert_eq!(batch.len(), 4);
        assert!(!batch.is_success());
        assert_eq!(batch.first_error, Some(EngineError::Handler("bad".into())));
        assert_eq!(batch.failures().count(), 2);
        assert_eq!(batch.values().copied().collect::<Vec<_>>(), vec![0, 3]);

        let summary = batch.error_summary();
        assert_eq!(summary.get(&ErrorKind::Handler), Some(&1));
        assert_eq!(summary.get(&ErrorKind::Timeout), Some(&1));
    }

    #[tokio::test]
    async fn test_wait_all_empty() {
        let batch = wait_all(Vec::<TaskFuture<u32>>::new()).await;
        assert!(batch.is_success());
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_abandon_uses_given_error() {
        let collector = ResultCollector::<u32>::new();
        let future = collector.register(TaskId::new()).unwrap();
        collector.abandon(EngineError::Cancelled(CancelCause::Timeout));
        assert_eq!(
            future.await.into_outcome(),
            Err(EngineError::Cancelled(CancelCause::Timeout))
        );
    }
}
