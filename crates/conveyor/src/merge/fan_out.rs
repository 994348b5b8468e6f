//! Spread one input stream across parallel workers

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{stream, FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use super::fan_in::{fan_in, FanIn};
use crate::cancel::CancellationToken;
use crate::error::{EngineError, Result};
use crate::queue::{BoundedQueue, OnFullPolicy};

/// Buffered items per worker output channel
const OUTPUT_BUFFER: usize = 16;

/// Output streams of [`fan_out`], one per worker
pub struct FanOut<Out> {
    outputs: Vec<ReceiverStream<Out>>,
    token: CancellationToken,
}

impl<Out: Send + 'static> FanOut<Out> {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn into_streams(self) -> Vec<ReceiverStream<Out>> {
        self.outputs
    }

    /// Merge the worker outputs back into one stream under the same token
    pub fn merge(self) -> FanIn<Out> {
        fan_in(self.outputs, &self.token)
    }
}

/// Consume `input` with `workers` parallel workers
///
/// Items are handed out first-come first-served through a bounded queue of
/// `workers` slots, so the input is pulled only as fast as the workers keep
/// up. Each worker writes to its own output stream. A failing or panicking
/// `work` call yields an `Err` item and the worker continues. Must be
/// called inside a tokio runtime.
pub fn fan_out<S, T, R, F, Fut>(
    input: S,
    workers: usize,
    token: &CancellationToken,
    work: F,
) -> Result<FanOut<Result<R>>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let work = Arc::new(work);
    spread(input, workers, token, move |item: T| {
        let work = Arc::clone(&work);
        guarded(async move { work(item).await })
    })
}

/// [`fan_out`] that tags every outcome with the input position
///
/// Items are numbered from 0 in input order and failures keep their
/// number, so the merged stream can go straight into
/// [`reordered`](super::reordered) without leaving gaps.
pub fn fan_out_indexed<S, T, R, F, Fut>(
    input: S,
    workers: usize,
    token: &CancellationToken,
    work: F,
) -> Result<FanOut<(u64, Result<R>)>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let work = Arc::new(work);
    let numbered = input.zip(stream::iter(0u64..)).map(|(item, seq)| (seq, item));
    spread(numbered, workers, token, move |(seq, item): (u64, T)| {
        let work = Arc::clone(&work);
        async move { (seq, guarded(async move { work(item).await }).await) }
    })
}

/// Run `work` to completion, turning errors and panics into engine errors
async fn guarded<R, Fut>(work: Fut) -> Result<R>
where
    Fut: Future<Output = anyhow::Result<R>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(EngineError::from_handler(err)),
        Err(payload) => Err(EngineError::from_panic(payload)),
    }
}

fn spread<S, T, Out, F, Fut>(
    input: S,
    workers: usize,
    token: &CancellationToken,
    run: F,
) -> Result<FanOut<Out>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    Out: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
{
    if workers == 0 {
        return Err(EngineError::InvalidConfig(
            "fan_out needs at least one worker".into(),
        ));
    }

    let queue = BoundedQueue::new(workers, OnFullPolicy::Block, token.clone())?;

    {
        let queue = queue.clone();
        let stop = token.cancelled_owned();
        tokio::spawn(async move {
            let mut input = std::pin::pin!(input.take_until(stop));
            let mut pumped = 0usize;
            while let Some(item) = input.next().await {
                if queue.put(item).await.is_err() {
                    break;
                }
                pumped += 1;
            }
            queue.close();
            debug!(pumped, "Fan-out input finished");
        });
    }

    let run = Arc::new(run);
    let live = Arc::new(AtomicUsize::new(workers));
    let mut outputs = Vec::with_capacity(workers);
    for index in 0..workers {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        outputs.push(ReceiverStream::new(rx));

        let queue = queue.clone();
        let run = Arc::clone(&run);
        let live = Arc::clone(&live);
        let token = token.clone();
        tokio::spawn(async move {
            while let Some(item) = queue.take().await {
                let outcome = run(item).await;
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    sent = tx.send(outcome) => sent.is_ok(),
                };
                if !sent {
                    trace!(worker = index, "Fan-out output closed");
                    break;
                }
            }

            // The pump stops once nobody is left to take from the queue.
            if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                queue.close();
            }
        });
    }

    Ok(FanOut {
        outputs,
        token: token.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::cancel::CancelCause;

    #[tokio::test]
    async fn test_every_item_processed_once() {
        let token = CancellationToken::new();
        let out = fan_out(stream::iter(0..100u32), 4, &token, |n| async move {
            Ok(n * 10)
        })
        .unwrap();
        assert_eq!(out.len(), 4);

        let results: Vec<u32> = out
            .merge()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(results.len(), 100);
        let unique: HashSet<u32> = results.into_iter().collect();
        assert_eq!(unique, (0..100).map(|n| n * 10).collect());
    }

    #[tokio::test]
    async fn test_panics_become_error_items() {
        let token = CancellationToken::new();
        let out = fan_out(stream::iter(0..6u32), 2, &token, |n| async move {
            if n == 3 {
                panic!("bad item {n}");
            }
            if n == 4 {
                anyhow::bail!("rejected {n}");
            }
            Ok(n)
        })
        .unwrap();

        let results: Vec<Result<u32>> = out.merge().collect().await;
        assert_eq!(results.len(), 6);
        assert!(results.contains(&Err(EngineError::HandlerPanic("bad item 3".into()))));
        assert!(results.contains(&Err(EngineError::Handler("rejected 4".into()))));
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let token = CancellationToken::new();
        let result = fan_out(stream::iter(0..1u32), 0, &token, |n| async move { Ok(n) });
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_outputs() {
        let token = CancellationToken::new();
        let out = fan_out(stream::pending::<u32>(), 3, &token, |n| async move { Ok(n) }).unwrap();
        let merged = out.merge();

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.fire(CancelCause::UserCancel);
        let items: Vec<_> = merged.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_indexed_failures_keep_their_position() {
        let token = CancellationToken::new();
        let input = stream::iter(["a", "", "c"]);
        let out = fan_out_indexed(input, 2, &token, |s: &'static str| async move {
            anyhow::ensure!(!s.is_empty(), "empty input");
            Ok(s.len())
        })
        .unwrap();

        let mut results: Vec<(u64, Result<usize>)> = out.merge().collect().await;
        results.sort_by_key(|(seq, _)| *seq);
        assert_eq!(
            results,
            vec![
                (0, Ok(1)),
                (1, Err(EngineError::Handler("empty input".into()))),
                (2, Ok(1)),
            ]
        );
    }
}
