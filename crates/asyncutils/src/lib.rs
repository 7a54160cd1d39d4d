//! Small async building blocks that don't belong to any one crate.
//!
//! - [`Gated`]: a future parked behind a one-shot [`Latch`] until released.
//! - [`TaskGraph`]: named units of work with declared prerequisites, run
//!   concurrently once everything they depend on has completed.

mod gate;
mod graph;

pub use crate::gate::{Gated, Latch, gate};
pub use crate::graph::{Failure, Running, TaskGraph};
