//! slotgrid-sim: an in-process stand-in for the outside world.
//!
//! [`SimCluster`] implements every collaborator trait the allocator and
//! scheduler need: it lists hosts, runs worker "processes" that finish
//! after a formula-derived duration on the tokio clock, and applies each
//! worker's effect to the simulated target when it finishes. Under a
//! paused tokio runtime the whole thing is deterministic.
//!
//! [`SimFormulas`] is the matching formula family.

pub mod cluster;
pub mod formulas;

pub use cluster::{Completion, SimCluster};
pub use formulas::SimFormulas;
