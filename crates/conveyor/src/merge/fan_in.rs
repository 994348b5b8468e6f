//! Merge produce-only streams into one

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use crate::cancel::CancellationToken;

/// Merged stream returned by [`fan_in`]
///
/// Items arrive first-ready-wins; there is no cross-stream ordering.
pub struct FanIn<T> {
    inner: BoxStream<'static, T>,
}

impl<T> fmt::Debug for FanIn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanIn").finish_non_exhaustive()
    }
}

impl<T> Stream for FanIn<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Merge `streams` into one
///
/// The result ends after every input has ended, or as soon as `token`
/// fires. An empty input ends immediately.
pub fn fan_in<S, T>(streams: impl IntoIterator<Item = S>, token: &CancellationToken) -> FanIn<T>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    let merged = stream::select_all(streams.into_iter().map(|s| s.boxed()));
    FanIn {
        inner: merged.take_until(token.cancelled_owned()).boxed(),
    }
}
