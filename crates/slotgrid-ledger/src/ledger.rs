//! Capacity ledger: host records and live allocations.
//!
//! All quantities are capacity blocks. A request asks for `units` workers
//! of `unit_size` blocks each; the ledger packs whole units onto hosts in
//! rank order and splits across hosts when no single host fits the lot.
//!
//! Allocation is all-or-nothing: the split is computed first and only
//! committed when every unit found a home.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use slot_core::{AllocationId, HostId, OwnerId};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::rank::rank_hosts;

/// Per-host capacity bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: HostId,
    pub total: u32,
    /// Blocks held back from allocation.
    pub reserved: u32,
    /// Blocks consumed by live allocations.
    pub used: u32,
}

impl HostRecord {
    pub fn new(host_id: HostId, total: u32, reserved: u32) -> Self {
        Self {
            host_id,
            total,
            reserved,
            used: 0,
        }
    }

    pub fn available(&self) -> u32 {
        self.total
            .saturating_sub(self.reserved)
            .saturating_sub(self.used)
    }

    /// `used + reserved <= total`.
    pub fn is_consistent(&self) -> bool {
        u64::from(self.used) + u64::from(self.reserved) <= u64::from(self.total)
    }
}

/// Which hosts a request may land on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFilter {
    #[default]
    Any,
    ExcludePrivileged,
    Only(Vec<HostId>),
}

impl HostFilter {
    pub fn allows(&self, host_id: &str, privileged: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::ExcludePrivileged => privileged != Some(host_id),
            Self::Only(hosts) => hosts.iter().any(|h| h == host_id),
        }
    }
}

/// An allocation request as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub units: u32,
    /// Blocks consumed by one unit.
    pub unit_size: u32,
    #[serde(default)]
    pub host_filter: HostFilter,
}

impl AllocationRequest {
    pub fn new(units: u32, unit_size: u32) -> Self {
        Self {
            units,
            unit_size,
            host_filter: HostFilter::Any,
        }
    }

    pub fn with_filter(mut self, filter: HostFilter) -> Self {
        self.host_filter = filter;
        self
    }
}

/// The part of a request granted on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub allocation_id: AllocationId,
    pub host_id: HostId,
    pub units: u32,
}

/// A live allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub host_id: HostId,
    pub owner_id: OwnerId,
    pub units: u32,
    /// Blocks held (`units * unit_size`).
    pub blocks: u32,
}

/// Aggregate capacity across all hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityStatus {
    pub total: u64,
    pub reserved: u64,
    pub available: u64,
}

/// The in-memory capacity ledger.
///
/// Owned by exactly one allocator service; never shared.
#[derive(Debug)]
pub struct CapacityLedger {
    privileged: Option<HostId>,
    hosts: BTreeMap<HostId, HostRecord>,
    allocations: BTreeMap<AllocationId, Allocation>,
    owners: HashMap<OwnerId, BTreeSet<AllocationId>>,
    next_id: u64,
}

impl CapacityLedger {
    pub fn new(privileged: Option<HostId>) -> Self {
        Self {
            privileged,
            hosts: BTreeMap::new(),
            allocations: BTreeMap::new(),
            owners: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn privileged(&self) -> Option<&str> {
        self.privileged.as_deref()
    }

    /// Create or update a host record from a fresh scan.
    ///
    /// Returns the change in the host's total blocks. Live allocations are
    /// never evicted; a host that shrinks below its usage simply reports
    /// zero available until allocations drain.
    pub fn refresh_host(&mut self, host_id: &str, total: u32, reserved: u32) -> i64 {
        match self.hosts.get_mut(host_id) {
            Some(record) => {
                let delta = i64::from(total) - i64::from(record.total);
                record.total = total;
                record.reserved = reserved;
                if delta != 0 {
                    info!(host = host_id, total, delta, "host capacity changed");
                }
                if !record.is_consistent() {
                    warn!(
                        host = host_id,
                        total,
                        reserved,
                        used = record.used,
                        "host capacity below live usage"
                    );
                }
                delta
            }
            None => {
                info!(host = host_id, total, reserved, "host discovered");
                self.hosts.insert(
                    host_id.to_string(),
                    HostRecord::new(host_id.to_string(), total, reserved),
                );
                i64::from(total)
            }
        }
    }

    /// Grant `request.units` units to `owner`, split across hosts.
    pub fn alloc(&mut self, owner: OwnerId, request: &AllocationRequest) -> LedgerResult<Vec<Grant>> {
        if request.unit_size == 0 {
            return Err(LedgerError::InvalidRequest("unit_size must be > 0".into()));
        }
        if request.units == 0 {
            return Ok(Vec::new());
        }

        let privileged = self.privileged.as_deref();
        let eligible = self
            .hosts
            .values()
            .filter(|h| request.host_filter.allows(&h.host_id, privileged));
        let ranked = rank_hosts(eligible, request.unit_size, privileged);

        let mut remaining = request.units;
        let mut split: Vec<(HostId, u32)> = Vec::new();
        for rank in &ranked {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(rank.fits);
            split.push((rank.host_id.clone(), take));
            remaining -= take;
        }

        if remaining > 0 {
            let available = ranked
                .iter()
                .fold(0u32, |acc, r| acc.saturating_add(r.fits));
            debug!(
                owner,
                requested = request.units,
                available,
                "allocation rejected"
            );
            return Err(LedgerError::Rejected {
                requested: request.units,
                available,
            });
        }

        let mut grants = Vec::with_capacity(split.len());
        for (host_id, units) in split {
            let blocks = units * request.unit_size;
            if let Some(record) = self.hosts.get_mut(&host_id) {
                record.used += blocks;
            }
            let id = AllocationId(self.next_id);
            self.next_id += 1;
            self.allocations.insert(
                id,
                Allocation {
                    id,
                    host_id: host_id.clone(),
                    owner_id: owner,
                    units,
                    blocks,
                },
            );
            self.owners.entry(owner).or_default().insert(id);
            grants.push(Grant {
                allocation_id: id,
                host_id,
                units,
            });
        }

        debug!(owner, units = request.units, hosts = grants.len(), "allocation granted");
        Ok(grants)
    }

    /// Release one allocation. Unknown or already-freed ids are a no-op.
    pub fn free(&mut self, id: AllocationId) -> Option<Allocation> {
        let allocation = self.allocations.remove(&id)?;
        if let Some(record) = self.hosts.get_mut(&allocation.host_id) {
            record.used = record.used.saturating_sub(allocation.blocks);
        }
        if let Some(ids) = self.owners.get_mut(&allocation.owner_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.owners.remove(&allocation.owner_id);
            }
        }
        Some(allocation)
    }

    /// Release everything held by `owner` and drop its bookkeeping entry.
    pub fn free_owner(&mut self, owner: OwnerId) -> Vec<Allocation> {
        let Some(ids) = self.owners.remove(&owner) else {
            return Vec::new();
        };
        ids.into_iter().filter_map(|id| self.free(id)).collect()
    }

    /// Owners currently holding at least one allocation.
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self.owners.keys().copied().collect();
        owners.sort_unstable();
        owners
    }

    pub fn allocations_of(&self, owner: OwnerId) -> Vec<&Allocation> {
        self.owners
            .get(&owner)
            .map(|ids| ids.iter().filter_map(|id| self.allocations.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn allocation(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn host(&self, host_id: &str) -> Option<&HostRecord> {
        self.hosts.get(host_id)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn status(&self) -> CapacityStatus {
        self.hosts.values().fold(CapacityStatus::default(), |mut s, h| {
            s.total += u64::from(h.total);
            s.reserved += u64::from(h.reserved);
            s.available += u64::from(h.available());
            s
        })
    }

    /// Whole units of `unit_size` that could be granted right now.
    pub fn available_units(&self, unit_size: u32, filter: &HostFilter) -> u64 {
        if unit_size == 0 {
            return 0;
        }
        let privileged = self.privileged.as_deref();
        self.hosts
            .values()
            .filter(|h| filter.allows(&h.host_id, privileged))
            .map(|h| u64::from(h.available() / unit_size))
            .sum()
    }

    /// Hosts whose records violate `used + reserved <= total`, or whose
    /// `used` disagrees with the sum of their live allocations.
    pub fn check_invariants(&self) -> Vec<HostId> {
        let mut held: HashMap<&str, u64> = HashMap::new();
        for allocation in self.allocations.values() {
            *held.entry(allocation.host_id.as_str()).or_default() += u64::from(allocation.blocks);
        }
        self.hosts
            .values()
            .filter(|h| {
                !h.is_consistent()
                    || held.get(h.host_id.as_str()).copied().unwrap_or(0) != u64::from(h.used)
            })
            .map(|h| h.host_id.clone())
            .collect()
    }
}
