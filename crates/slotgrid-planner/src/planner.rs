//! Regime selection and the admission-control search.
//!
//! The regime follows the target state:
//! - volatility above its floor: a Single corrective batch
//! - yield below its ceiling: a Paired replenish batch
//! - otherwise: a Four-stage extraction batch
//!
//! Single and Paired batches shrink arithmetically to fit the budget. The
//! Four-stage batch walks the Primary unit count down from the count that
//! extracts the target fraction until the whole batch fits. Fewer Primary
//! units never need more total units, so the first fit is the largest.

use slot_core::{Formulas, OperationKind, TargetState, ceil_units};
use tracing::{debug, trace};

use crate::batch::{Batch, Budget};
use crate::error::{PlanError, PlanResult};

/// Result of a planning attempt with search statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub batch: Option<Batch>,
    /// Candidate sizes tried by the Four-stage search.
    pub trials: u32,
    /// Primary units the search started from.
    pub initial_primary: u32,
}

impl PlanOutcome {
    fn done(batch: Option<Batch>) -> Self {
        Self {
            batch,
            trials: 0,
            initial_primary: 0,
        }
    }
}

/// Plan the next batch for `state` within `budget`.
///
/// `extraction_fraction` is the share of the current yield a Four-stage
/// batch aims to extract.
pub fn plan(
    state: &TargetState,
    formulas: &dyn Formulas,
    budget: Budget,
    extraction_fraction: f64,
) -> PlanResult<Option<Batch>> {
    plan_detailed(state, formulas, budget, extraction_fraction).map(|o| o.batch)
}

pub fn plan_detailed(
    state: &TargetState,
    formulas: &dyn Formulas,
    budget: Budget,
    extraction_fraction: f64,
) -> PlanResult<PlanOutcome> {
    validate_state(state)?;

    if state.needs_correction() {
        plan_single(state, formulas, budget).map(PlanOutcome::done)
    } else if state.needs_replenish() {
        plan_paired(state, formulas, budget).map(PlanOutcome::done)
    } else {
        plan_four_stage(state, formulas, budget, extraction_fraction)
    }
}

fn validate_state(state: &TargetState) -> PlanResult<()> {
    let fields = [
        ("difficulty", state.difficulty),
        ("floor", state.floor),
        ("yield", state.yield_amount),
        ("ceiling", state.ceiling),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(PlanError::InvalidState(format!("{name} is {value}")));
        }
    }
    Ok(())
}

fn corrective_effect(formulas: &dyn Formulas) -> PlanResult<f64> {
    let effect = formulas.effects().corrective;
    if effect.is_finite() && effect > 0.0 {
        Ok(effect)
    } else {
        Err(PlanError::InvalidFormula(format!(
            "corrective effect per unit is {effect}"
        )))
    }
}

fn plan_single(state: &TargetState, formulas: &dyn Formulas, budget: Budget) -> PlanResult<Option<Batch>> {
    let effect = corrective_effect(formulas)?;
    let needed = ceil_units((state.difficulty - state.floor) / effect);
    let units = budget.clamp(needed);
    if units == 0 {
        return Ok(None);
    }
    if units < needed {
        debug!(needed, units, "partial correction");
    }
    Ok(Some(Batch::single(units)))
}

fn plan_paired(state: &TargetState, formulas: &dyn Formulas, budget: Budget) -> PlanResult<Option<Batch>> {
    corrective_effect(formulas)?;
    let ratio = formulas.effects().ratio(OperationKind::Secondary);
    let mut secondary = formulas.secondary_units_to_restore(state);
    let total = |g: u32| u64::from(g) + u64::from(formulas.corrective_units(OperationKind::Secondary, g));

    if !budget.fits(total(secondary))
        && let Budget::Units(limit) = budget
    {
        let shrunk = (limit as f64 / (1.0 + ratio)).floor();
        secondary = secondary.min(if shrunk >= f64::from(u32::MAX) { u32::MAX } else { shrunk as u32 });
        // Rounding the corrective count up can still overshoot by one.
        while secondary > 0 && !budget.fits(total(secondary)) {
            secondary -= 1;
        }
    }
    if secondary == 0 {
        return Ok(None);
    }
    let corrective = formulas.corrective_units(OperationKind::Secondary, secondary);
    Ok(Some(Batch::paired(secondary, corrective)))
}

/// Size a Four-stage batch for `state`, regardless of regime.
///
/// Used directly for pre-flight sizing against a prepared target.
pub fn plan_four_stage(
    state: &TargetState,
    formulas: &dyn Formulas,
    budget: Budget,
    extraction_fraction: f64,
) -> PlanResult<PlanOutcome> {
    corrective_effect(formulas)?;
    if !(extraction_fraction.is_finite() && extraction_fraction > 0.0) {
        return Err(PlanError::InvalidFormula(format!(
            "extraction fraction is {extraction_fraction}"
        )));
    }
    let per_unit = formulas.extraction_fraction_per_unit(state);
    if !per_unit.is_finite() || per_unit < 0.0 {
        return Err(PlanError::InvalidFormula(format!(
            "extraction fraction per unit is {per_unit}"
        )));
    }
    if per_unit == 0.0 {
        return Ok(PlanOutcome::done(None));
    }

    let initial = (extraction_fraction / per_unit).floor();
    let initial = if initial >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        initial as u32
    };
    // A batch never fits with more Primary units than the budget holds.
    let initial_primary = budget.clamp(initial);

    let mut trials = 0;
    let mut primary = initial_primary;
    while primary > 0 {
        trials += 1;
        let corrective_a = formulas.corrective_units(OperationKind::Primary, primary);
        let depleted = state.yield_amount * (1.0 - (per_unit * f64::from(primary)).min(1.0));
        let secondary = formulas.secondary_units_to_restore(&state.with_yield(depleted));
        let corrective_b = formulas.corrective_units(OperationKind::Secondary, secondary);
        let batch = Batch::four_stage(primary, corrective_a, secondary, corrective_b);

        trace!(primary, total = batch.total_units(), %budget, "four-stage trial");
        if budget.fits(batch.total_units()) {
            return Ok(PlanOutcome {
                batch: Some(batch),
                trials,
                initial_primary,
            });
        }
        primary -= 1;
    }

    debug!(initial_primary, trials, %budget, "no four-stage batch fits");
    Ok(PlanOutcome {
        batch: None,
        trials,
        initial_primary,
    })
}

/// Optimistically apply `batch` to `state`, as if every stage completed
/// with its nominal effect.
pub fn project(state: &TargetState, batch: &Batch, formulas: &dyn Formulas) -> TargetState {
    let effects = formulas.effects();
    let mut next = *state;
    let primary = batch.units(OperationKind::Primary);
    let secondary = batch.units(OperationKind::Secondary);
    let corrective = batch.units(OperationKind::CorrectiveA) + batch.units(OperationKind::CorrectiveB);

    if primary > 0 {
        let fraction = (formulas.extraction_fraction_per_unit(state) * f64::from(primary)).min(1.0);
        next.yield_amount -= next.yield_amount * fraction;
    }
    if secondary > 0 {
        next.yield_amount = formulas.yield_after_secondary(&next, secondary);
    }
    next.difficulty += effects.increase(OperationKind::Primary, primary)
        + effects.increase(OperationKind::Secondary, secondary)
        - effects.corrective * f64::from(corrective);
    next.difficulty = next.difficulty.max(next.floor);
    next
}
