//! Host ordering for allocation requests.
//!
//! Candidate hosts are ranked so a request lands where it leaves the
//! least unusable remainder:
//! - **Privileged host last**: the local host is only used when nothing
//!   else fits
//! - **Fragmentation**: smallest `available % unit_size` first
//! - **Headroom**: most available blocks first
//! - **Host id**: ties broken deterministically

use slot_core::HostId;

use crate::ledger::HostRecord;

/// Ranked view of one candidate host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRank {
    pub host_id: HostId,
    /// Whole units of the requested size the host can take.
    pub fits: u32,
    /// Blocks left over after packing whole units.
    pub fragment: u32,
    pub available: u32,
    pub privileged: bool,
}

/// Rank a single host, or `None` when it cannot take one unit.
pub fn rank_host(host: &HostRecord, unit_size: u32, privileged: Option<&str>) -> Option<HostRank> {
    if unit_size == 0 {
        return None;
    }
    let available = host.available();
    let fits = available / unit_size;
    if fits == 0 {
        return None;
    }
    Some(HostRank {
        host_id: host.host_id.clone(),
        fits,
        fragment: available % unit_size,
        available,
        privileged: privileged.is_some_and(|p| p == host.host_id),
    })
}

/// Rank all hosts and return them best first.
pub fn rank_hosts<'a, I>(hosts: I, unit_size: u32, privileged: Option<&str>) -> Vec<HostRank>
where
    I: IntoIterator<Item = &'a HostRecord>,
{
    let mut ranks: Vec<HostRank> = hosts
        .into_iter()
        .filter_map(|h| rank_host(h, unit_size, privileged))
        .collect();

    ranks.sort_by(|a, b| {
        a.privileged
            .cmp(&b.privileged)
            .then(a.fragment.cmp(&b.fragment))
            .then(b.available.cmp(&a.available))
            .then(a.host_id.cmp(&b.host_id))
    });
    ranks
}
