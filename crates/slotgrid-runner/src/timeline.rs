//! Stage timeline for one batch.
//!
//! Given the previous batch anchor `L`, the current instant `N`, the skew
//! `S` and the guard `G`, the batch end `E` is the earliest instant that
//! is at least `S` past `L` and still reachable by every stage launched
//! now. Corrective stages target fixed completion instants; deferred
//! stages get a window of acceptable completion instants.
//!
//! | shape | stage | completes |
//! |---|---|---|
//! | four-stage | primary | `[L+G, E-G]` |
//! | four-stage | corrective-a | `E` |
//! | four-stage | secondary | `[E+G, E+S-G]` |
//! | four-stage | corrective-b | `E+S` |
//! | paired | secondary | `[L+G, E-G]` |
//! | paired | corrective-b | `E` |
//! | single | corrective-a | `E` |
//!
//! The next batch anchors on the last corrective completion.

use std::time::Duration;

use slot_core::{Formulas, OperationKind, TargetState, WorkerKind};
use slotgrid_planner::BatchShape;
use tokio::time::Instant;

/// Fresh duration of each worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDurations {
    pub primary: Duration,
    pub secondary: Duration,
    pub corrective: Duration,
}

impl StageDurations {
    pub fn from_formulas(formulas: &dyn Formulas, state: &TargetState) -> Self {
        Self {
            primary: formulas.duration(WorkerKind::Extract, state),
            secondary: formulas.duration(WorkerKind::Replenish, state),
            corrective: formulas.duration(WorkerKind::Correct, state),
        }
    }

    pub fn uniform(duration: Duration) -> Self {
        Self {
            primary: duration,
            secondary: duration,
            corrective: duration,
        }
    }

    pub fn of(&self, kind: OperationKind) -> Duration {
        match kind.worker() {
            WorkerKind::Extract => self.primary,
            WorkerKind::Replenish => self.secondary,
            WorkerKind::Correct => self.corrective,
        }
    }
}

/// Acceptable completion instants for a deferred stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub earliest_end: Instant,
    pub latest_end: Instant,
}

impl Window {
    pub fn contains(&self, end: Instant) -> bool {
        end >= self.earliest_end && end <= self.latest_end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTiming {
    /// Launch so the stage completes at `end`; never aborts.
    Immediate { end: Instant },
    /// Launch once the stage can complete inside `window`.
    Deferred { window: Window },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub shape: BatchShape,
    /// `E`: completion instant of the first corrective stage.
    pub end: Instant,
    /// Anchor handed to the next batch.
    pub anchor: Instant,
    pub stages: Vec<(OperationKind, StageTiming)>,
}

impl Timeline {
    pub fn compute(
        shape: BatchShape,
        previous_anchor: Instant,
        now: Instant,
        durations: &StageDurations,
        skew: Duration,
        guard: Duration,
    ) -> Self {
        let mut end = (previous_anchor + skew).max(now + durations.corrective);
        match shape {
            BatchShape::Single => {}
            BatchShape::Paired => {
                end = end.max(now + durations.secondary + guard * 2);
            }
            BatchShape::FourStage => {
                end = end.max(now + durations.primary + guard * 2);
                let secondary_end = now + durations.secondary + guard * 2;
                if let Some(needed) = secondary_end.checked_sub(skew) {
                    end = end.max(needed);
                }
            }
        }

        let before_end = Window {
            earliest_end: previous_anchor + guard,
            latest_end: end.checked_sub(guard).unwrap_or(end),
        };
        let (stages, anchor) = match shape {
            BatchShape::Single => (
                vec![(OperationKind::CorrectiveA, StageTiming::Immediate { end })],
                end,
            ),
            BatchShape::Paired => (
                vec![
                    (OperationKind::Secondary, StageTiming::Deferred { window: before_end }),
                    (OperationKind::CorrectiveB, StageTiming::Immediate { end }),
                ],
                end,
            ),
            BatchShape::FourStage => (
                vec![
                    (OperationKind::Primary, StageTiming::Deferred { window: before_end }),
                    (OperationKind::CorrectiveA, StageTiming::Immediate { end }),
                    (
                        OperationKind::Secondary,
                        StageTiming::Deferred {
                            window: Window {
                                earliest_end: end + guard,
                                latest_end: end + skew - guard,
                            },
                        },
                    ),
                    (OperationKind::CorrectiveB, StageTiming::Immediate { end: end + skew }),
                ],
                end + skew,
            ),
        };

        Self {
            shape,
            end,
            anchor,
            stages,
        }
    }

    pub fn timing(&self, kind: OperationKind) -> Option<StageTiming> {
        self.stages.iter().find(|(k, _)| *k == kind).map(|(_, t)| *t)
    }
}

/// The first instant at which the next batch must launch its corrective
/// stage to complete exactly `skew` after `previous_anchor`.
pub fn earliest_start(previous_anchor: Instant, skew: Duration, corrective: Duration) -> Instant {
    let target = previous_anchor + skew;
    target.checked_sub(corrective).unwrap_or(target)
}
