//! Restore sequence order after a fan-in

use std::collections::BTreeMap;

use futures::{future, stream, Stream, StreamExt};
use tracing::{debug, trace};

/// Buffers out-of-order items until their predecessors arrive
///
/// Sequence numbers start at 0 unless created with
/// [`starting_at`](Self::starting_at). Late and duplicate items are dropped.
/// A sequence number that will never carry an item must be released with
/// [`skip`](Self::skip), otherwise everything after it stays buffered.
#[derive(Debug, Clone)]
pub struct Reorder<T> {
    next: u64,
    // `None` marks a skipped sequence number.
    buffer: BTreeMap<u64, Option<T>>,
}

impl<T> Default for Reorder<T> {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl<T> Reorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(seq: u64) -> Self {
        Self {
            next: seq,
            buffer: BTreeMap::new(),
        }
    }

    /// Accept `value` tagged with `seq`, returning every item now in order
    pub fn push(&mut self, seq: u64, value: T) -> Vec<T> {
        self.fill(seq, Some(value))
    }

    /// Mark `seq` as never arriving, returning every item now in order
    pub fn skip(&mut self, seq: u64) -> Vec<T> {
        self.fill(seq, None)
    }

    /// Release everything still buffered in sequence order, gaps and all
    pub fn finish(self) -> Vec<T> {
        if !self.buffer.is_empty() {
            debug!(
                next = self.next,
                held = self.buffer.len(),
                "Flushing items held behind a sequence gap"
            );
        }
        self.buffer.into_values().flatten().collect()
    }

    fn fill(&mut self, seq: u64, slot: Option<T>) -> Vec<T> {
        if seq < self.next || self.buffer.contains_key(&seq) {
            trace!(seq, next = self.next, "Dropping late or duplicate item");
            return Vec::new();
        }
        self.buffer.insert(seq, slot);

        let mut ready = Vec::new();
        while let Some(slot) = self.buffer.remove(&self.next) {
            ready.extend(slot);
            self.next += 1;
        }
        ready
    }

    /// Sequence number the buffer is waiting for
    pub fn next_seq(&self) -> u64 {
        self.next
    }

    /// Items held back waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.buffer.values().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Re-sort a stream of `(seq, item)` pairs into sequence order
///
/// When the input ends, items still waiting behind a gap are flushed in
/// sequence order rather than lost.
pub fn reordered<S, T>(input: S) -> impl Stream<Item = T>
where
    S: Stream<Item = (u64, T)>,
{
    input
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .scan(Reorder::new(), |buffer, item| {
            let ready = match item {
                Some((seq, value)) => buffer.push(seq, value),
                None => std::mem::take(buffer).finish(),
            };
            future::ready(Some(ready))
        })
        .flat_map(stream::iter)
}
