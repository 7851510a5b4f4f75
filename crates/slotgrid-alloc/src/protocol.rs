//! Wire types exchanged between allocator clients and the service.
//!
//! Every type here is plain serde data; the in-process transport pairs a
//! [`Request`] with a oneshot reply, but the JSON form is the same one a
//! networked transport would carry.

use serde::{Deserialize, Serialize};
use slot_core::{AllocationId, OwnerId};
use slotgrid_ledger::{AllocationRequest, CapacityStatus, Grant, HostFilter};
use tokio::sync::oneshot;

/// Identifies one logical request. Retries reuse the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub owner_id: OwnerId,
    pub request_id: u64,
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    Alloc(AllocationRequest),
    Free { allocation_id: AllocationId },
    Status,
    /// Whole units of `unit_size` currently grantable through `host_filter`.
    Capacity {
        unit_size: u32,
        #[serde(default)]
        host_filter: HostFilter,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alloc(_) => "alloc",
            Self::Free { .. } => "free",
            Self::Status => "status",
            Self::Capacity { .. } => "capacity",
        }
    }

    /// Whether a repeat of this operation must be answered from cache.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Alloc(_) | Self::Free { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub correlation: CorrelationId,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Granted { grants: Vec<Grant> },
    Rejected { requested: u32, available: u32 },
    /// `released` is false when the id was unknown or already freed.
    Freed { released: bool },
    Status { status: CapacityStatus },
    Capacity { units: u64 },
    Invalid { reason: String },
}

/// A request in flight on the in-process channel.
#[derive(Debug)]
pub struct Envelope {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let request = Request {
            correlation: CorrelationId {
                owner_id: 42,
                request_id: 7,
            },
            operation: Operation::Free {
                allocation_id: AllocationId(3),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["correlation"]["owner_id"], 42);
        assert_eq!(value["operation"]["kind"], "free");
        assert_eq!(value["operation"]["payload"]["allocation_id"], 3);

        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn status_has_no_payload() {
        let request = Request {
            correlation: CorrelationId {
                owner_id: 1,
                request_id: 1,
            },
            operation: Operation::Status,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["operation"]["kind"], "status");
        assert!(value["operation"].get("payload").is_none());
    }

    #[test]
    fn rejection_is_tagged() {
        let value = serde_json::to_value(Response::Rejected {
            requested: 10,
            available: 4,
        })
        .unwrap();
        assert_eq!(value["result"], "rejected");
        assert_eq!(value["available"], 4);
    }

    #[test]
    fn only_alloc_and_free_mutate() {
        assert!(Operation::Alloc(AllocationRequest::new(1, 1)).is_mutating());
        assert!(Operation::Free { allocation_id: AllocationId(1) }.is_mutating());
        assert!(!Operation::Status.is_mutating());
        assert_eq!(Operation::Status.name(), "status");
    }
}
