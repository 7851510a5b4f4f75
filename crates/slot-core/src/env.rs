//! Collaborator traits: the parts of the outside world the allocator and
//! scheduler depend on.
//!
//! - [`HostInventory`] enumerates hosts and their memory.
//! - [`ProcessControl`] starts, polls and stops worker processes.
//! - [`TargetSource`] reports the live state of a target.
//!
//! All of them are synchronous; waiting on a process is done by polling
//! [`ProcessControl::is_alive`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HostId, Pid, TargetState, WorkerKind};

/// Memory reported for one host by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub host_id: HostId,
    /// Total memory on the host.
    pub memory: f64,
    /// Memory the host itself keeps back from allocation.
    pub reserved_memory: f64,
}

/// Source of the current host set.
pub trait HostInventory: Send + Sync {
    fn scan(&self) -> Vec<HostCapacity>;
}

/// Parameters for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub worker: WorkerKind,
    pub host_id: HostId,
    pub threads: u32,
    pub target: String,
    /// Free-form arguments (batch id, stage label) for diagnostics.
    pub args: Vec<String>,
}

/// Errors reported when a worker cannot be started.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LaunchError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("insufficient memory on {host}: need {needed}, {free} free")]
    InsufficientMemory { host: String, needed: f64, free: f64 },

    #[error("launch rejected: {0}")]
    Rejected(String),
}

/// Worker process supervision surface.
pub trait ProcessControl: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Pid, LaunchError>;

    fn is_alive(&self, pid: Pid) -> bool;

    /// Returns `true` if a live process was killed.
    fn kill(&self, pid: Pid) -> bool;
}

/// Live view of target state.
pub trait TargetSource: Send + Sync {
    fn observe(&self, target: &str) -> Option<TargetState>;
}
