//! Batch shapes and budgets.

use std::fmt;

use serde::{Deserialize, Serialize};
use slot_core::OperationKind;

/// Capacity available to a plan, in units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Units(u64),
    /// No limit; used for pre-flight sizing.
    Unlimited,
}

impl Budget {
    pub fn fits(&self, units: u64) -> bool {
        match self {
            Self::Units(limit) => units <= *limit,
            Self::Unlimited => true,
        }
    }

    pub fn clamp(&self, units: u32) -> u32 {
        match self {
            Self::Units(limit) => units.min(u32::try_from(*limit).unwrap_or(u32::MAX)),
            Self::Unlimited => units,
        }
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Units(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchShape {
    /// One corrective stage.
    Single,
    /// Secondary, then CorrectiveB.
    Paired,
    /// Primary, CorrectiveA, Secondary, CorrectiveB.
    FourStage,
}

impl BatchShape {
    /// Stage kinds in canonical completion order.
    pub fn kinds(&self) -> &'static [OperationKind] {
        match self {
            Self::Single => &[OperationKind::CorrectiveA],
            Self::Paired => &[OperationKind::Secondary, OperationKind::CorrectiveB],
            Self::FourStage => &OperationKind::ALL,
        }
    }

    /// 1-based position of `kind` in the canonical order.
    pub fn ordinal(&self, kind: OperationKind) -> Option<usize> {
        self.kinds().iter().position(|k| *k == kind).map(|i| i + 1)
    }

    /// Canonical order string, e.g. `"1234"`.
    pub fn canonical_order(&self) -> String {
        (1..=self.kinds().len()).map(|i| i.to_string()).collect()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Paired => "paired",
            Self::FourStage => "four-stage",
        }
    }
}

impl fmt::Display for BatchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    pub kind: OperationKind,
    pub units: u32,
}

/// A planned batch: a shape and the unit count of each of its stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub shape: BatchShape,
    /// One entry per shape kind, in canonical order.
    pub stages: Vec<StagePlan>,
}

impl Batch {
    pub fn single(corrective: u32) -> Self {
        Self::from_units(BatchShape::Single, &[corrective])
    }

    pub fn paired(secondary: u32, corrective: u32) -> Self {
        Self::from_units(BatchShape::Paired, &[secondary, corrective])
    }

    pub fn four_stage(primary: u32, corrective_a: u32, secondary: u32, corrective_b: u32) -> Self {
        Self::from_units(
            BatchShape::FourStage,
            &[primary, corrective_a, secondary, corrective_b],
        )
    }

    fn from_units(shape: BatchShape, units: &[u32]) -> Self {
        Self {
            shape,
            stages: shape
                .kinds()
                .iter()
                .zip(units)
                .map(|(kind, units)| StagePlan {
                    kind: *kind,
                    units: *units,
                })
                .collect(),
        }
    }

    /// Units planned for `kind`; zero when the shape has no such stage.
    pub fn units(&self, kind: OperationKind) -> u32 {
        self.stages
            .iter()
            .find(|s| s.kind == kind)
            .map_or(0, |s| s.units)
    }

    pub fn total_units(&self) -> u64 {
        self.stages.iter().map(|s| u64::from(s.units)).sum()
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.shape)?;
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", stage.kind.label(), stage.units)?;
        }
        f.write_str("]")
    }
}
