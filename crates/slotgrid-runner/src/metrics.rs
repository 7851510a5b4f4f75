//! Run counters and the end-of-run summary.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use slot_core::{OperationKind, TargetState};

use crate::runner::{BatchReport, Classification};
use crate::stage::{AbortReason, StageState};

/// Outcome counts for one deferred stage kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeferredCounts {
    pub ok: u64,
    pub late: u64,
}

/// Counters accumulated by the scheduling loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    /// Batches started.
    pub queued: u64,
    /// Batches whose stages all resolved.
    pub finished: u64,
    pub success: u64,
    pub partial: u64,
    pub out_of_order: u64,
    /// Scheduling attempts that found no capacity.
    pub oom_events: u64,
    pub plan_errors: u64,
    pub primary: DeferredCounts,
    pub secondary: DeferredCounts,
    pub aborted_late: u64,
    pub aborted_cancelled: u64,
    pub aborted_launch_failed: u64,
    pub aborted_shutdown: u64,
}

impl RunMetrics {
    pub fn in_flight(&self) -> u64 {
        self.queued.saturating_sub(self.finished)
    }

    pub fn record(&mut self, report: &BatchReport) {
        self.finished += 1;
        match report.classification {
            Classification::Success => self.success += 1,
            Classification::Partial => self.partial += 1,
            Classification::OutOfOrder => self.out_of_order += 1,
        }

        for stage in &report.stages {
            let deferred = match stage.kind {
                OperationKind::Primary => Some(&mut self.primary),
                OperationKind::Secondary => Some(&mut self.secondary),
                _ => None,
            };
            if let Some(counts) = deferred {
                match (stage.state, stage.abort_reason) {
                    (StageState::Completed, _) => counts.ok += 1,
                    (_, Some(AbortReason::Late)) => counts.late += 1,
                    _ => {}
                }
            }
            match stage.abort_reason {
                Some(AbortReason::Late) => self.aborted_late += 1,
                Some(AbortReason::Cancelled) => self.aborted_cancelled += 1,
                Some(AbortReason::LaunchFailed) => self.aborted_launch_failed += 1,
                Some(AbortReason::Shutdown) => self.aborted_shutdown += 1,
                None => {}
            }
        }
    }

    pub fn aborted_stages(&self) -> u64 {
        self.aborted_late + self.aborted_cancelled + self.aborted_launch_failed + self.aborted_shutdown
    }
}

/// Why the scheduling loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    /// Prep mode reached floor and ceiling.
    Prepared,
    MaxBatches,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shutdown => "shutdown",
            Self::Prepared => "target prepared",
            Self::MaxBatches => "batch limit reached",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub target: String,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    pub final_state: Option<TargetState>,
    pub metrics: RunMetrics,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metrics;
        writeln!(
            f,
            "run summary for {} ({}, {:.1}s)",
            self.target,
            self.stop_reason,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(f, "  batches:   {} queued, {} finished", m.queued, m.finished)?;
        writeln!(
            f,
            "  outcome:   {} success, {} partial, {} out-of-order",
            m.success, m.partial, m.out_of_order
        )?;
        writeln!(
            f,
            "  deferred:  primary {} ok / {} late, secondary {} ok / {} late",
            m.primary.ok, m.primary.late, m.secondary.ok, m.secondary.late
        )?;
        writeln!(
            f,
            "  aborts:    {} late, {} cancelled, {} launch-failed, {} shutdown",
            m.aborted_late, m.aborted_cancelled, m.aborted_launch_failed, m.aborted_shutdown
        )?;
        write!(f, "  oom:       {} events, {} plan errors", m.oom_events, m.plan_errors)?;
        if let Some(state) = &self.final_state {
            write!(
                f,
                "\n  target:    difficulty {:.3} (floor {:.3}), yield {:.1} / {:.1}",
                state.difficulty, state.floor, state.yield_amount, state.ceiling
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use slotgrid_planner::BatchShape;

    use super::*;
    use crate::stage::StageReport;

    fn stage(kind: OperationKind, reason: Option<AbortReason>) -> StageReport {
        let mut report = StageReport::new(kind, 1);
        report.advance(StageState::AllocationRequested);
        report.advance(StageState::Allocated);
        match reason {
            Some(reason) => {
                report.abort(reason);
            }
            None => {
                report.advance(StageState::Launched);
                report.advance(StageState::Running);
                report.advance(StageState::Completed);
            }
        }
        report
    }

    fn report(classification: Classification, stages: Vec<StageReport>) -> BatchReport {
        BatchReport {
            batch_id: 1,
            shape: BatchShape::FourStage,
            observed_order: String::new(),
            canonical_order: "1234".into(),
            classification,
            stages,
        }
    }

    #[test]
    fn counts_classifications_and_deferred_outcomes() {
        let mut metrics = RunMetrics {
            queued: 3,
            ..Default::default()
        };
        metrics.record(&report(
            Classification::Success,
            OperationKind::ALL.iter().map(|k| stage(*k, None)).collect(),
        ));
        metrics.record(&report(
            Classification::Partial,
            vec![
                stage(OperationKind::Primary, Some(AbortReason::Cancelled)),
                stage(OperationKind::CorrectiveA, None),
                stage(OperationKind::Secondary, Some(AbortReason::Late)),
                stage(OperationKind::CorrectiveB, None),
            ],
        ));

        assert_eq!(metrics.finished, 2);
        assert_eq!(metrics.in_flight(), 1);
        assert_eq!((metrics.success, metrics.partial), (1, 1));
        assert_eq!(metrics.primary, DeferredCounts { ok: 1, late: 0 });
        assert_eq!(metrics.secondary, DeferredCounts { ok: 1, late: 1 });
        assert_eq!(metrics.aborted_stages(), 2);
        assert_eq!(metrics.aborted_cancelled, 1);
    }

    #[test]
    fn summary_renders_counts() {
        let mut metrics = RunMetrics {
            queued: 1,
            ..Default::default()
        };
        metrics.record(&report(Classification::OutOfOrder, vec![]));
        let summary = RunSummary {
            target: "t".into(),
            stop_reason: StopReason::MaxBatches,
            elapsed: Duration::from_secs(3),
            final_state: None,
            metrics,
        };
        let text = summary.to_string();
        assert!(text.starts_with("run summary for t (batch limit reached, 3.0s)"));
        assert!(text.contains("0 success, 0 partial, 1 out-of-order"));
        assert!(!text.contains("target:"));
    }
}
