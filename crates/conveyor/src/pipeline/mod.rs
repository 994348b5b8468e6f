//! Multi-stage pipelines
//!
//! A pipeline chains worker pools. Each stage transforms `I -> O`; the
//! builder checks at compile time that stage `k`'s output type is stage
//! `k+1`'s input type.
//!
//! ```text
//!  submit ──▶ [stage 1 queue] ─▶ workers ─▶ link ─▶ [stage 2 queue] ─▶ workers ─▶ sink
//!                                              │                                │
//!                                              │ Err                            │
//!                                              ▼                                ▼
//!                                       ┌──────────────────────────────────────────┐
//!                                       │            ResultCollector               │
//!                                       └──────────────────────────────────────────┘
//! ```
//!
//! - Inter-stage queues always block, so a slow stage pushes back all the
//!   way to `submit`.
//! - A stage error skips the remaining stages.
//! - Closing the pipeline closes stage 1; stage `k+1` is closed only after
//!   every worker of stage `k` has exited.

mod chain;
mod link;
mod stage;

pub use chain::{Pipeline, PipelineBuilder};
pub use stage::{Stage, StageConfig};
