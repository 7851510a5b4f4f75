//! slotgrid-alloc: the allocator service and its client library.
//!
//! The service owns the [`CapacityLedger`](slotgrid_ledger::CapacityLedger)
//! outright and is reached only through an [`AllocatorHandle`]. Requests
//! are serialized by a single `mpsc` consumer, so the ledger needs no
//! locking. A housekeeping tick rescans the host inventory and reclaims
//! allocations whose owner process has died.
//!
//! Clients tag each request with a [`CorrelationId`]; a retried request
//! with the same id is answered from the service's response cache rather
//! than executed twice.

pub mod client;
pub mod error;
pub mod protocol;
pub mod service;

pub use client::{AllocatorClient, ClientSettings, Reservation, launch_pinned};
pub use error::{AllocError, AllocResult};
pub use protocol::{CorrelationId, Operation, Request, Response};
pub use service::{AllocatorHandle, AllocatorService, AllocatorSettings, HousekeepingReport};
