//! slotgrid-ledger: in-memory capacity bookkeeping.
//!
//! The ledger tracks, per host, how many capacity blocks exist, how many
//! are held back, and which allocations currently consume the rest. It
//! performs no I/O: the allocator service feeds it host scans and
//! requests, and it answers synchronously.
//!
//! # Components
//!
//! - **`rank`**: host ordering for a request (fragmentation first)
//! - **`ledger`**: host records, alloc/free/status, owner tracking

pub mod error;
pub mod ledger;
pub mod rank;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{
    Allocation, AllocationRequest, CapacityLedger, CapacityStatus, Grant, HostFilter, HostRecord,
};
pub use rank::{HostRank, rank_hosts};
