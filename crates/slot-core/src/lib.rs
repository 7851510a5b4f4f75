//! slot-core: shared types for the slotgrid capacity allocator and
//! batch scheduler.
//!
//! Everything the allocator, planner and runner agree on lives here:
//! identifiers, operation kinds, the numeric target state, the traits
//! through which the outside world (hosts, worker processes, formulas)
//! is reached, and the TOML configuration.

pub mod config;
pub mod env;
pub mod formulas;
pub mod types;

pub use config::{GridConfig, parse_duration};
pub use env::{HostCapacity, HostInventory, LaunchError, LaunchSpec, ProcessControl, TargetSource};
pub use formulas::{Formulas, VolatilityEffects, ceil_units};
pub use types::*;
