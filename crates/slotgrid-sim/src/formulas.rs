//! Formula family used by the simulated target.

use std::time::Duration;

use slot_core::config::SimTargetConfig;
use slot_core::{Formulas, TargetState, WorkerKind};

const SECONDARY_FACTOR: f64 = 3.2;
const CORRECTIVE_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimFormulas {
    /// Primary duration at zero difficulty.
    pub base_time: Duration,
    /// Per-unit multiplicative yield growth of Secondary workers.
    pub growth_rate: f64,
    /// Fraction extracted per Primary unit at zero difficulty.
    pub extraction_rate: f64,
}

impl Default for SimFormulas {
    fn default() -> Self {
        Self::from_config(&SimTargetConfig::default())
    }
}

impl SimFormulas {
    pub fn new(base_time: Duration, growth_rate: f64, extraction_rate: f64) -> Self {
        Self {
            base_time,
            growth_rate,
            extraction_rate,
        }
    }

    pub fn from_config(config: &SimTargetConfig) -> Self {
        Self::new(config.base_time(), config.growth_rate, config.extraction_rate)
    }

    fn primary_duration(&self, state: &TargetState) -> Duration {
        let factor = (2.5 * state.difficulty + 500.0) / 500.0;
        scale(self.base_time, factor)
    }

    /// Uncapped yield after `units` Secondary units.
    fn grown_yield(&self, state: &TargetState, units: u32) -> f64 {
        let units = f64::from(units);
        (state.yield_amount.max(0.0) + units) * (1.0 + self.growth_rate).powf(units)
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    if factor.is_finite() && factor > 0.0 {
        duration.mul_f64(factor)
    } else {
        Duration::ZERO
    }
}

impl Formulas for SimFormulas {
    fn duration(&self, kind: WorkerKind, state: &TargetState) -> Duration {
        let primary = self.primary_duration(state);
        match kind {
            WorkerKind::Extract => primary,
            WorkerKind::Replenish => scale(primary, SECONDARY_FACTOR),
            WorkerKind::Correct => scale(primary, CORRECTIVE_FACTOR),
        }
    }

    fn extraction_fraction_per_unit(&self, state: &TargetState) -> f64 {
        (self.extraction_rate * (100.0 - state.difficulty) / 100.0).max(0.0)
    }

    fn secondary_units_to_restore(&self, state: &TargetState) -> u32 {
        if !state.needs_replenish() {
            return 0;
        }
        let reaches = |units: u32| self.grown_yield(state, units) >= state.ceiling;

        let mut hi: u32 = 1;
        while !reaches(hi) {
            if hi >= u32::MAX / 2 {
                return u32::MAX;
            }
            hi *= 2;
        }
        let mut lo = hi / 2;
        // smallest u in (lo, hi] that reaches the ceiling
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if reaches(mid) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        if reaches(lo) { lo } else { hi }
    }

    fn yield_after_secondary(&self, state: &TargetState, units: u32) -> f64 {
        if units == 0 {
            return state.yield_amount.min(state.ceiling);
        }
        self.grown_yield(state, units).min(state.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(difficulty: f64, yield_amount: f64) -> TargetState {
        TargetState {
            difficulty,
            floor: 2.0,
            yield_amount,
            ceiling: 1_000_000.0,
        }
    }

    #[test]
    fn durations_scale_with_difficulty() {
        let formulas = SimFormulas::new(Duration::from_secs(2), 0.0025, 0.004);
        let at_zero = formulas.duration(WorkerKind::Extract, &state(0.0, 0.0));
        assert_eq!(at_zero, Duration::from_secs(2));

        // (2.5 * 100 + 500) / 500 = 1.5
        let hard = formulas.duration(WorkerKind::Extract, &state(100.0, 0.0));
        assert_eq!(hard, Duration::from_secs(3));

        let s = state(10.0, 0.0);
        let primary = formulas.duration(WorkerKind::Extract, &s).as_secs_f64();
        let secondary = formulas.duration(WorkerKind::Replenish, &s).as_secs_f64();
        let corrective = formulas.duration(WorkerKind::Correct, &s).as_secs_f64();
        assert!((secondary / primary - 3.2).abs() < 1e-6);
        assert!((corrective / primary - 4.0).abs() < 1e-6);
    }

    #[test]
    fn extraction_falls_with_difficulty() {
        let formulas = SimFormulas::default();
        assert!((formulas.extraction_fraction_per_unit(&state(0.0, 0.0)) - 0.004).abs() < 1e-12);
        assert!((formulas.extraction_fraction_per_unit(&state(50.0, 0.0)) - 0.002).abs() < 1e-12);
        assert_eq!(formulas.extraction_fraction_per_unit(&state(120.0, 0.0)), 0.0);
    }

    #[test]
    fn restore_units_is_minimal() {
        let formulas = SimFormulas::default();
        let s = state(2.0, 750_000.0);
        let units = formulas.secondary_units_to_restore(&s);
        assert!(units > 0);
        assert_eq!(formulas.yield_after_secondary(&s, units), s.ceiling);
        assert!(formulas.yield_after_secondary(&s, units - 1) < s.ceiling);
    }

    #[test]
    fn restore_units_from_empty_and_full() {
        let formulas = SimFormulas::default();
        assert_eq!(formulas.secondary_units_to_restore(&state(2.0, 1_000_000.0)), 0);

        let empty = state(2.0, 0.0);
        let units = formulas.secondary_units_to_restore(&empty);
        assert!(formulas.yield_after_secondary(&empty, units) >= empty.ceiling);
    }

    #[test]
    fn linear_growth_without_rate() {
        let formulas = SimFormulas::new(Duration::from_secs(1), 0.0, 0.004);
        let s = TargetState {
            difficulty: 1.0,
            floor: 1.0,
            yield_amount: 90.0,
            ceiling: 100.0,
        };
        assert_eq!(formulas.secondary_units_to_restore(&s), 10);
    }
}
