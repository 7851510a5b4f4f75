use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    /// A formula returned something no batch can be built from.
    #[error("invalid formula output: {0}")]
    InvalidFormula(String),

    #[error("invalid target state: {0}")]
    InvalidState(String),
}

pub type PlanResult<T> = Result<T, PlanError>;
