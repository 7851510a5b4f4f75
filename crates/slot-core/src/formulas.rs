//! Formula provider: pure functions of target state.
//!
//! The planner and runner never hard-code how long an operation takes or
//! how much one unit changes the target. They ask a [`Formulas`]
//! implementation, which may be backed by a game model, a simulation, or
//! a fixed stub in tests.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{OperationKind, TargetState, WorkerKind};

/// Per-unit volatility effect of each worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityEffects {
    /// Volatility added by one Primary unit.
    pub primary: f64,
    /// Volatility added by one Secondary unit.
    pub secondary: f64,
    /// Volatility removed by one corrective unit.
    pub corrective: f64,
}

impl Default for VolatilityEffects {
    fn default() -> Self {
        Self {
            primary: 0.002,
            secondary: 0.004,
            corrective: 0.05,
        }
    }
}

impl VolatilityEffects {
    /// Corrective units needed per provoking unit of `kind`.
    pub fn ratio(&self, kind: OperationKind) -> f64 {
        let provoked = match kind {
            OperationKind::Primary => self.primary,
            OperationKind::Secondary => self.secondary,
            OperationKind::CorrectiveA | OperationKind::CorrectiveB => return 0.0,
        };
        if self.corrective > 0.0 {
            provoked / self.corrective
        } else {
            0.0
        }
    }

    /// Volatility added by `units` of `kind`.
    pub fn increase(&self, kind: OperationKind, units: u32) -> f64 {
        let per_unit = match kind {
            OperationKind::Primary => self.primary,
            OperationKind::Secondary => self.secondary,
            OperationKind::CorrectiveA | OperationKind::CorrectiveB => 0.0,
        };
        per_unit * f64::from(units)
    }
}

/// Externally supplied formulas for durations and effects.
pub trait Formulas: Send + Sync {
    /// How long a worker of `kind` takes when started against `state`.
    fn duration(&self, kind: WorkerKind, state: &TargetState) -> Duration;

    /// Fraction of the current yield one Primary unit extracts.
    fn extraction_fraction_per_unit(&self, state: &TargetState) -> f64;

    /// Secondary units needed to bring the yield in `state` to its ceiling.
    fn secondary_units_to_restore(&self, state: &TargetState) -> u32;

    /// Yield after `units` Secondary units run against `state`, capped at
    /// the ceiling.
    fn yield_after_secondary(&self, state: &TargetState, units: u32) -> f64;

    fn effects(&self) -> VolatilityEffects {
        VolatilityEffects::default()
    }

    /// Corrective units that exactly offset `provoking` units of `kind`,
    /// rounded up.
    fn corrective_units(&self, kind: OperationKind, provoking: u32) -> u32 {
        ceil_units(f64::from(provoking) * self.effects().ratio(kind))
    }
}

/// Round a non-negative unit count up, ignoring float noise below 1e-9.
pub fn ceil_units(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let rounded = (value - 1e-9).ceil();
    if rounded >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        rounded as u32
    }
}
