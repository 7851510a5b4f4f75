//! slotgrid-runner: turn planned batches into running workers.
//!
//! The runner lays each batch out on a timeline anchored to the previous
//! batch, reserves capacity for every stage, launches corrective stages at
//! fixed instants and deferred stages inside execution windows, then
//! checks the order in which the stages actually completed.
//!
//! # Architecture
//!
//! ```text
//! SchedulingLoop
//!   ├── Planner (plan / project)
//!   ├── AllocatorClient (budget, reservations)
//!   └── BatchRunner
//!       ├── Timeline (anchor, windows)
//!       └── one task per stage
//!           ├── wait (instant or window)
//!           ├── launch_pinned
//!           └── poll until done, release
//! ```

pub mod error;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod stage;
pub mod timeline;

pub use error::{SchedulerError, SchedulerResult};
pub use metrics::{DeferredCounts, RunMetrics, RunSummary, StopReason};
pub use runner::{BatchHandle, BatchReport, BatchRunner, Classification, RunnerSettings};
pub use scheduler::{LoopSettings, SchedulingLoop};
pub use stage::{AbortReason, StageOutcome, StageReport, StageState};
pub use timeline::{StageDurations, StageTiming, Timeline, Window};
