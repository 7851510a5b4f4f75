use slot_core::LaunchError;
use thiserror::Error;

/// Errors surfaced to allocator clients.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AllocError {
    #[error("allocation rejected: {requested} units requested, {available} available")]
    Rejected { requested: u32, available: u32 },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("request {request_id} timed out after {attempts} attempts")]
    Timeout { request_id: u64, attempts: u32 },

    #[error("allocator service closed")]
    ServiceClosed,

    #[error("unexpected response to {operation}")]
    UnexpectedResponse { operation: &'static str },

    #[error("worker launch failed: {0}")]
    Launch(#[from] LaunchError),
}

pub type AllocResult<T> = Result<T, AllocError>;
