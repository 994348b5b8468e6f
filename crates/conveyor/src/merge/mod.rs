//! Fan-out / fan-in
//!
//! [`fan_out`] spreads one input stream across `n` workers, each with its
//! own output stream. [`fan_in`] merges produce-only streams into one.
//! Merging is first-ready-wins; callers that need the input order tag items
//! with a sequence number and re-sort with [`Reorder`] or [`reordered`].
//! [`fan_out_indexed`] does the tagging itself and keeps the number on
//! failed items, so one bad item never stalls the re-sort.
//!
//! ```text
//!                   ┌─▶ worker 0 ─▶ out 0 ─┐
//!  input ─▶ queue ──┼─▶ worker 1 ─▶ out 1 ─┼──▶ fan_in ──▶ (Reorder) ──▶ consumer
//!                   └─▶ worker 2 ─▶ out 2 ─┘
//! ```

mod fan_in;
mod fan_out;
mod reorder;

pub use fan_in::{fan_in, FanIn};
pub use fan_out::{fan_out, fan_out_indexed, FanOut};
pub use reorder::{reordered, Reorder};
