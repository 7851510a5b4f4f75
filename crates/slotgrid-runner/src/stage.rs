//! Per-stage lifecycle.

use std::fmt;

use serde::Serialize;
use slot_core::{OperationKind, Pid};
use tracing::trace;

/// Lifecycle of one stage.
///
/// `Planned -> AllocationRequested -> Allocated -> Launched -> Running ->
/// Completed`, or off to `Rejected` (no capacity) or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Planned,
    AllocationRequested,
    Allocated,
    Launched,
    Running,
    Completed,
    Rejected,
    Aborted,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Aborted)
    }

    pub fn can_advance_to(&self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Planned, AllocationRequested)
                | (AllocationRequested, Allocated)
                | (AllocationRequested, Rejected)
                | (Allocated, Launched)
                | (Allocated, Aborted)
                | (Launched, Running)
                | (Launched, Aborted)
                | (Running, Completed)
                | (Running, Aborted)
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::AllocationRequested => "allocation-requested",
            Self::Allocated => "allocated",
            Self::Launched => "launched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a stage did not run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The stage could no longer complete inside its window.
    Late,
    /// A stage it depends on aborted first.
    Cancelled,
    LaunchFailed,
    Shutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Late => "late",
            Self::Cancelled => "cancelled",
            Self::LaunchFailed => "launch-failed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Rejected,
    Aborted(AbortReason),
}

/// Tracks one stage through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub kind: OperationKind,
    pub units: u32,
    pub state: StageState,
    pub abort_reason: Option<AbortReason>,
    pub pids: Vec<Pid>,
}

impl StageReport {
    pub fn new(kind: OperationKind, units: u32) -> Self {
        Self {
            kind,
            units,
            state: StageState::Planned,
            abort_reason: None,
            pids: Vec::new(),
        }
    }

    /// Move to `next`. Illegal transitions are ignored and reported as
    /// `false`.
    pub fn advance(&mut self, next: StageState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        trace!(stage = self.kind.label(), from = %self.state, to = %next, "stage transition");
        self.state = next;
        true
    }

    pub fn abort(&mut self, reason: AbortReason) -> bool {
        let moved = self.advance(StageState::Aborted);
        if moved {
            self.abort_reason = Some(reason);
        }
        moved
    }

    pub fn outcome(&self) -> Option<StageOutcome> {
        match self.state {
            StageState::Completed => Some(StageOutcome::Completed),
            StageState::Rejected => Some(StageOutcome::Rejected),
            StageState::Aborted => Some(StageOutcome::Aborted(self.abort_reason.unwrap_or(AbortReason::Shutdown))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut stage = StageReport::new(OperationKind::Primary, 10);
        for next in [
            StageState::AllocationRequested,
            StageState::Allocated,
            StageState::Launched,
            StageState::Running,
            StageState::Completed,
        ] {
            assert!(stage.advance(next), "{next}");
        }
        assert!(stage.state.is_terminal());
        assert_eq!(stage.outcome(), Some(StageOutcome::Completed));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut stage = StageReport::new(OperationKind::Secondary, 4);
        stage.advance(StageState::AllocationRequested);
        stage.advance(StageState::Allocated);
        assert!(stage.abort(AbortReason::Late));
        assert!(!stage.advance(StageState::Launched));
        assert!(!stage.abort(AbortReason::Shutdown));
        assert_eq!(stage.outcome(), Some(StageOutcome::Aborted(AbortReason::Late)));
    }

    #[test]
    fn rejection_only_from_allocation() {
        let mut stage = StageReport::new(OperationKind::CorrectiveA, 1);
        assert!(!stage.advance(StageState::Rejected));
        stage.advance(StageState::AllocationRequested);
        assert!(stage.advance(StageState::Rejected));
        assert_eq!(stage.outcome(), Some(StageOutcome::Rejected));
        assert!(StageReport::new(OperationKind::Primary, 1).outcome().is_none());
    }
}
