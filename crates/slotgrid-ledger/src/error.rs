//! Ledger error types.

use thiserror::Error;

/// Errors returned by ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Not enough capacity across eligible hosts; nothing was allocated.
    #[error("allocation rejected: {requested} units requested, {available} available")]
    Rejected { requested: u32, available: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
