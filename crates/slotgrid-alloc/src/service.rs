//! Allocator service: the single owner of the capacity ledger.
//!
//! Requests arrive on an `mpsc` channel and are handled one at a time.
//! Between requests the service runs housekeeping on a fixed period:
//!
//! 1. Rescan the host inventory and apply capacity deltas
//! 2. Reclaim allocations whose owner process is no longer alive
//!
//! The run loop stops when the shutdown `watch` flips or every handle is
//! dropped, and hands the final ledger back to whoever awaits it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use slot_core::config::AllocatorConfig;
use slot_core::{HostCapacity, HostId, HostInventory, OwnerId, ProcessControl};
use slotgrid_ledger::{CapacityLedger, LedgerError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{AllocatorClient, ClientSettings};
use crate::protocol::{CorrelationId, Envelope, Operation, Request, Response};

const CHANNEL_CAPACITY: usize = 256;
const RESPONSE_CACHE_CAPACITY: usize = 1024;

/// Service settings, usually derived from `[allocator]` config.
#[derive(Debug, Clone)]
pub struct AllocatorSettings {
    /// Memory represented by one capacity block.
    pub block_size: f64,
    pub housekeeping_period: Duration,
    /// Host that is deprioritised for allocation.
    pub privileged_host: Option<HostId>,
    /// Per-host reserved-memory overrides.
    pub reserved: HashMap<HostId, f64>,
    pub response_cache: usize,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self::from_config(&AllocatorConfig::default())
    }
}

impl AllocatorSettings {
    pub fn from_config(config: &AllocatorConfig) -> Self {
        let privileged = config.privileged_host.trim();
        Self {
            block_size: config.block_size,
            housekeeping_period: config.housekeeping_period(),
            privileged_host: (!privileged.is_empty()).then(|| privileged.to_string()),
            reserved: config.reserved.clone(),
            response_cache: RESPONSE_CACHE_CAPACITY,
        }
    }

    /// Convert a host's memory into `(total_blocks, reserved_blocks)`.
    ///
    /// Allocatable blocks are `floor((memory - reserved) / block_size)`;
    /// whatever the reserve swallows beyond that is reported as reserved.
    pub fn blocks_for(&self, host: &HostCapacity) -> (u32, u32) {
        if self.block_size.is_nan() || self.block_size <= 0.0 || !host.memory.is_finite() {
            return (0, 0);
        }
        let reserved_memory = self
            .reserved
            .get(&host.host_id)
            .copied()
            .unwrap_or(host.reserved_memory)
            .max(0.0);
        let to_blocks =
            |memory: f64| (memory.max(0.0) / self.block_size).floor().min(f64::from(u32::MAX)) as u32;

        let total = to_blocks(host.memory);
        let usable = to_blocks(host.memory - reserved_memory).min(total);
        (total, total - usable)
    }
}

/// Outcome of one housekeeping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub hosts_added: usize,
    pub hosts_changed: usize,
    pub owners_reaped: Vec<OwnerId>,
    pub blocks_freed: u64,
}

/// Bounded FIFO of responses to mutating requests.
#[derive(Debug)]
struct ResponseCache {
    capacity: usize,
    order: VecDeque<CorrelationId>,
    responses: HashMap<CorrelationId, Response>,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            responses: HashMap::new(),
        }
    }

    fn get(&self, id: &CorrelationId) -> Option<&Response> {
        self.responses.get(id)
    }

    fn insert(&mut self, id: CorrelationId, response: Response) {
        if self.responses.insert(id, response).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.responses.remove(&old);
            }
        }
    }
}

/// The allocator service. Construct, then [`spawn`](Self::spawn) it.
pub struct AllocatorService {
    ledger: CapacityLedger,
    settings: AllocatorSettings,
    inventory: Arc<dyn HostInventory>,
    processes: Arc<dyn ProcessControl>,
    cache: ResponseCache,
}

impl AllocatorService {
    /// Build the service and take an initial inventory scan.
    pub fn new(
        settings: AllocatorSettings,
        inventory: Arc<dyn HostInventory>,
        processes: Arc<dyn ProcessControl>,
    ) -> Self {
        let mut service = Self {
            ledger: CapacityLedger::new(settings.privileged_host.clone()),
            cache: ResponseCache::new(settings.response_cache),
            settings,
            inventory,
            processes,
        };
        service.rescan();
        service
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    /// Handle one request. Repeats of a mutating request are answered
    /// from the response cache.
    pub fn handle(&mut self, request: &Request) -> Response {
        let mutating = request.operation.is_mutating();
        if mutating && let Some(cached) = self.cache.get(&request.correlation) {
            debug!(correlation = %request.correlation, "replaying cached response");
            return cached.clone();
        }

        let response = self.execute(request.correlation.owner_id, &request.operation);
        if mutating {
            self.cache.insert(request.correlation, response.clone());
        }
        response
    }

    fn execute(&mut self, owner: OwnerId, operation: &Operation) -> Response {
        match operation {
            Operation::Alloc(request) => match self.ledger.alloc(owner, request) {
                Ok(grants) => Response::Granted { grants },
                Err(LedgerError::Rejected {
                    requested,
                    available,
                }) => Response::Rejected {
                    requested,
                    available,
                },
                Err(e) => Response::Invalid {
                    reason: e.to_string(),
                },
            },
            Operation::Free { allocation_id } => Response::Freed {
                released: self.ledger.free(*allocation_id).is_some(),
            },
            Operation::Status => Response::Status {
                status: self.ledger.status(),
            },
            Operation::Capacity {
                unit_size,
                host_filter,
            } => Response::Capacity {
                units: self.ledger.available_units(*unit_size, host_filter),
            },
        }
    }

    /// Rescan the inventory and apply capacity changes.
    pub fn rescan(&mut self) -> (usize, usize) {
        let mut added = 0;
        let mut changed = 0;
        for host in self.inventory.scan() {
            let (total, reserved) = self.settings.blocks_for(&host);
            let known = self.ledger.host(&host.host_id).cloned();
            self.ledger.refresh_host(&host.host_id, total, reserved);
            match known {
                None => added += 1,
                Some(prev) if prev.total != total || prev.reserved != reserved => changed += 1,
                Some(_) => {}
            }
        }
        (added, changed)
    }

    /// Free every allocation held by an owner that is no longer alive.
    pub fn collect_garbage(&mut self) -> (Vec<OwnerId>, u64) {
        let mut reaped = Vec::new();
        let mut blocks = 0u64;
        for owner in self.ledger.owners() {
            if self.processes.is_alive(owner) {
                continue;
            }
            let freed = self.ledger.free_owner(owner);
            let owner_blocks: u64 = freed.iter().map(|a| u64::from(a.blocks)).sum();
            info!(owner, allocations = freed.len(), blocks = owner_blocks, "reclaimed allocations of dead owner");
            blocks += owner_blocks;
            reaped.push(owner);
        }
        (reaped, blocks)
    }

    /// One full housekeeping pass.
    pub fn housekeeping(&mut self) -> HousekeepingReport {
        let (hosts_added, hosts_changed) = self.rescan();
        let (owners_reaped, blocks_freed) = self.collect_garbage();

        let violations = self.ledger.check_invariants();
        if !violations.is_empty() {
            warn!(hosts = ?violations, "ledger invariant violated");
        }

        let report = HousekeepingReport {
            hosts_added,
            hosts_changed,
            owners_reaped,
            blocks_freed,
        };
        debug!(
            hosts_added = report.hosts_added,
            hosts_changed = report.hosts_changed,
            owners_reaped = report.owners_reaped.len(),
            blocks_freed = report.blocks_freed,
            "housekeeping pass"
        );
        report
    }

    /// Start the service loop on the tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (AllocatorHandle, JoinHandle<CapacityLedger>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(self.run(rx, shutdown));
        (AllocatorHandle { tx }, handle)
    }

    /// The service loop. Returns the final ledger.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> CapacityLedger {
        let period = self.settings.housekeeping_period;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            hosts = self.ledger.hosts().count(),
            period_ms = period.as_millis() as u64,
            "allocator service started"
        );

        loop {
            tokio::select! {
                envelope = requests.recv() => {
                    let Some(Envelope { request, reply }) = envelope else {
                        debug!("all allocator handles dropped");
                        break;
                    };
                    let response = self.handle(&request);
                    // Requester may have timed out and gone away.
                    let _ = reply.send(response);
                }
                _ = ticker.tick() => {
                    self.housekeeping();
                }
                _ = shutdown.changed() => {
                    debug!("allocator service shutting down");
                    break;
                }
            }
        }

        let status = self.ledger.status();
        info!(
            live_allocations = self.ledger.live_allocations(),
            available = status.available,
            "allocator service stopped"
        );
        self.ledger
    }
}

/// Cloneable sending side of the service channel.
#[derive(Debug, Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Envelope>,
}

impl AllocatorHandle {
    pub fn client(&self, owner_id: OwnerId, settings: ClientSettings) -> AllocatorClient {
        AllocatorClient::new(owner_id, self.tx.clone(), settings)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
