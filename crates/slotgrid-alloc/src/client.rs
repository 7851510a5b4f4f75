//! Client side of the allocator protocol.
//!
//! Each client speaks for one owner (normally the scheduler's own process
//! id, so the service can reap its allocations if it dies). Requests get
//! a fresh request id; a timed-out request is resent with the same id so
//! the service can answer it from cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use slot_core::config::AllocatorConfig;
use slot_core::{AllocationId, LaunchSpec, OwnerId, Pid, ProcessControl, WorkerKind};
use slotgrid_ledger::{AllocationRequest, CapacityStatus, Grant, HostFilter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{AllocError, AllocResult};
use crate::protocol::{CorrelationId, Envelope, Operation, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub timeout: Duration,
    /// Resends after the first attempt.
    pub retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            retries: 3,
        }
    }
}

impl ClientSettings {
    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            retries: config.request_retries,
        }
    }
}

/// The grants of one successful `alloc`, released together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub owner_id: OwnerId,
    pub grants: Vec<Grant>,
}

impl Reservation {
    pub fn units(&self) -> u32 {
        self.grants.iter().map(|g| g.units).sum()
    }

    pub fn allocation_ids(&self) -> impl Iterator<Item = AllocationId> + '_ {
        self.grants.iter().map(|g| g.allocation_id)
    }
}

#[derive(Debug)]
pub struct AllocatorClient {
    owner_id: OwnerId,
    tx: mpsc::Sender<Envelope>,
    settings: ClientSettings,
    next_request: AtomicU64,
}

impl AllocatorClient {
    /// Client over a raw request channel. Most callers go through
    /// [`AllocatorHandle::client`](crate::AllocatorHandle::client).
    pub fn new(owner_id: OwnerId, tx: mpsc::Sender<Envelope>, settings: ClientSettings) -> Self {
        Self {
            owner_id,
            tx,
            settings,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    async fn call(&self, operation: Operation) -> AllocResult<Response> {
        let correlation = CorrelationId {
            owner_id: self.owner_id,
            request_id: self.next_request.fetch_add(1, Ordering::Relaxed),
        };
        let request = Request {
            correlation,
            operation,
        };
        let attempts = self.settings.retries.saturating_add(1);

        for attempt in 1..=attempts {
            let (reply, response) = oneshot::channel();
            self.tx
                .send(Envelope {
                    request: request.clone(),
                    reply,
                })
                .await
                .map_err(|_| AllocError::ServiceClosed)?;

            match tokio::time::timeout(self.settings.timeout, response).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(AllocError::ServiceClosed),
                Err(_) => {
                    warn!(
                        %correlation,
                        operation = request.operation.name(),
                        attempt,
                        "allocator request timed out"
                    );
                }
            }
        }

        Err(AllocError::Timeout {
            request_id: correlation.request_id,
            attempts,
        })
    }

    /// Reserve capacity. A rejection leaves nothing allocated.
    pub async fn alloc(&self, request: AllocationRequest) -> AllocResult<Reservation> {
        match self.call(Operation::Alloc(request)).await? {
            Response::Granted { grants } => {
                debug!(owner = self.owner_id, hosts = grants.len(), "reservation granted");
                Ok(Reservation {
                    owner_id: self.owner_id,
                    grants,
                })
            }
            Response::Rejected {
                requested,
                available,
            } => Err(AllocError::Rejected {
                requested,
                available,
            }),
            Response::Invalid { reason } => Err(AllocError::Invalid(reason)),
            _ => Err(AllocError::UnexpectedResponse { operation: "alloc" }),
        }
    }

    /// Free one allocation. Returns whether anything was released.
    pub async fn free(&self, allocation_id: AllocationId) -> AllocResult<bool> {
        match self.call(Operation::Free { allocation_id }).await? {
            Response::Freed { released } => Ok(released),
            _ => Err(AllocError::UnexpectedResponse { operation: "free" }),
        }
    }

    /// Free every grant in a reservation.
    pub async fn release(&self, reservation: &Reservation) -> AllocResult<()> {
        for id in reservation.allocation_ids() {
            self.free(id).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> AllocResult<CapacityStatus> {
        match self.call(Operation::Status).await? {
            Response::Status { status } => Ok(status),
            _ => Err(AllocError::UnexpectedResponse { operation: "status" }),
        }
    }

    /// Whole units of `unit_size` currently grantable through `host_filter`.
    pub async fn available_units(&self, unit_size: u32, host_filter: HostFilter) -> AllocResult<u64> {
        match self
            .call(Operation::Capacity {
                unit_size,
                host_filter,
            })
            .await?
        {
            Response::Capacity { units } => Ok(units),
            _ => Err(AllocError::UnexpectedResponse {
                operation: "capacity",
            }),
        }
    }
}

/// Start one worker per grant, pinned to the grant's host.
///
/// If any launch fails the workers already started are killed and the
/// error is returned; releasing the reservation is left to the caller.
pub fn launch_pinned(
    processes: &dyn ProcessControl,
    reservation: &Reservation,
    worker: WorkerKind,
    target: &str,
    args: &[String],
) -> AllocResult<Vec<Pid>> {
    let mut pids = Vec::with_capacity(reservation.grants.len());
    for grant in &reservation.grants {
        let spec = LaunchSpec {
            worker,
            host_id: grant.host_id.clone(),
            threads: grant.units,
            target: target.to_string(),
            args: args.to_vec(),
        };
        match processes.launch(&spec) {
            Ok(pid) => pids.push(pid),
            Err(e) => {
                for pid in pids {
                    processes.kill(pid);
                }
                return Err(e.into());
            }
        }
    }
    Ok(pids)
}
