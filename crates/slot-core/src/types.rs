//! Shared types used across slotgrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a host that contributes capacity.
pub type HostId = String;

/// Process id of a worker or of a client that owns allocations.
pub type Pid = u64;

/// Identity of an allocation owner (the requesting client's process id).
pub type OwnerId = Pid;

/// Opaque token naming one live allocation on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// The worker program a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Takes yield out of the target and raises its volatility.
    Extract,
    /// Restores yield towards the ceiling and raises volatility.
    Replenish,
    /// Lowers volatility towards the floor.
    Correct,
}

impl WorkerKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Extract => "extract",
            WorkerKind::Replenish => "replenish",
            WorkerKind::Correct => "correct",
        }
    }
}

/// The four operation kinds of the steady-state pipeline.
///
/// The declaration order is the canonical completion order of a
/// four-stage batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Primary,
    CorrectiveA,
    Secondary,
    CorrectiveB,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Primary,
        OperationKind::CorrectiveA,
        OperationKind::Secondary,
        OperationKind::CorrectiveB,
    ];

    pub fn worker(&self) -> WorkerKind {
        match self {
            OperationKind::Primary => WorkerKind::Extract,
            OperationKind::Secondary => WorkerKind::Replenish,
            OperationKind::CorrectiveA | OperationKind::CorrectiveB => WorkerKind::Correct,
        }
    }

    /// Deferred stages wait for an execution window; corrective stages
    /// launch at their planned instant.
    pub fn is_deferred(&self) -> bool {
        matches!(self, OperationKind::Primary | OperationKind::Secondary)
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Primary => "primary",
            OperationKind::CorrectiveA => "corrective-a",
            OperationKind::Secondary => "secondary",
            OperationKind::CorrectiveB => "corrective-b",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Numeric state of the target the batches operate on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Volatility metric ("difficulty"). Lower is better.
    pub difficulty: f64,
    /// Minimum achievable volatility.
    pub floor: f64,
    /// Yield metric currently available.
    pub yield_amount: f64,
    /// Maximum achievable yield.
    pub ceiling: f64,
}

impl TargetState {
    pub fn needs_correction(&self) -> bool {
        self.difficulty > self.floor
    }

    pub fn needs_replenish(&self) -> bool {
        self.yield_amount < self.ceiling
    }

    /// At floor volatility and ceiling yield.
    pub fn is_prepared(&self) -> bool {
        !self.needs_correction() && !self.needs_replenish()
    }

    /// Yield as a fraction of the ceiling (1.0 when the ceiling is zero).
    pub fn yield_ratio(&self) -> f64 {
        if self.ceiling > 0.0 {
            self.yield_amount / self.ceiling
        } else {
            1.0
        }
    }

    pub fn with_difficulty(mut self, difficulty: f64) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_yield(mut self, yield_amount: f64) -> Self {
        self.yield_amount = yield_amount;
        self
    }
}
