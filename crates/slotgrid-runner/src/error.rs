//! Scheduler error types.

use slotgrid_alloc::AllocError;
use slotgrid_planner::PlanError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("target not found: {0}")]
    UnknownTarget(String),

    #[error("insufficient capacity: a full batch needs {needed} units, {available} available")]
    InsufficientCapacity { needed: u64, available: u64 },

    #[error("allocation error: {0}")]
    Alloc(#[from] AllocError),

    #[error("planning error: {0}")]
    Plan(#[from] PlanError),
}

impl SchedulerError {
    /// Whether the error means "not enough capacity right now".
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::Alloc(AllocError::Rejected { .. }))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
