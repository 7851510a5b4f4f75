//! slotgrid-planner: decide what the next batch looks like.
//!
//! [`plan`] is a pure function of the target state, the formula provider
//! and a capacity budget. It picks a regime from the target state, sizes
//! every stage, and shrinks the batch until it fits the budget. When even
//! the smallest useful batch does not fit it returns `None`, which callers
//! treat as out-of-memory.

pub mod batch;
pub mod error;
pub mod planner;

pub use batch::{Batch, BatchShape, Budget, StagePlan};
pub use error::{PlanError, PlanResult};
pub use planner::{PlanOutcome, plan, plan_detailed, plan_four_stage, project};
