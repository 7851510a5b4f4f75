//! Simulated hosts, processes and target.
//!
//! Worker processes have no task of their own. Each carries a finish
//! instant on the tokio clock; every call into the cluster first settles
//! the workers whose instant has passed, in finish order, applying their
//! effects to the target. Polling cadence therefore never changes the
//! order in which effects land.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slot_core::{
    Formulas, GridConfig, HostCapacity, HostId, HostInventory, LaunchError, LaunchSpec, Pid,
    ProcessControl, TargetSource, TargetState, WorkerKind,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::formulas::SimFormulas;

const FIRST_PID: Pid = 1000;
const MAX_DIFFICULTY: f64 = 100.0;

/// A worker that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub pid: Pid,
    pub worker: WorkerKind,
    pub host_id: HostId,
    pub threads: u32,
    pub target: String,
    pub args: Vec<String>,
    pub finished_at: Instant,
}

#[derive(Debug)]
struct SimHost {
    memory: f64,
    used: f64,
}

#[derive(Debug)]
struct SimWorker {
    spec: LaunchSpec,
    memory: f64,
    finish_at: Instant,
}

#[derive(Debug)]
enum SimProcess {
    /// A process with no workload that lives until terminated.
    Owner,
    Worker(SimWorker),
}

#[derive(Debug)]
struct SimState {
    hosts: BTreeMap<HostId, SimHost>,
    targets: HashMap<String, TargetState>,
    processes: HashMap<Pid, SimProcess>,
    completions: Vec<Completion>,
    next_pid: Pid,
    rng: StdRng,
    jitter: f64,
}

/// The simulated environment.
pub struct SimCluster {
    state: Mutex<SimState>,
    formulas: Arc<dyn Formulas>,
    /// Memory consumed by one worker thread.
    thread_memory: f64,
}

impl fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCluster")
            .field("state", &self.state)
            .field("thread_memory", &self.thread_memory)
            .finish_non_exhaustive()
    }
}

impl SimCluster {
    pub fn new(formulas: SimFormulas, thread_memory: f64) -> Self {
        Self::with_formulas(Arc::new(formulas), thread_memory)
    }

    /// Drive durations and effects from any formula provider.
    pub fn with_formulas(formulas: Arc<dyn Formulas>, thread_memory: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                hosts: BTreeMap::new(),
                targets: HashMap::new(),
                processes: HashMap::new(),
                completions: Vec::new(),
                next_pid: FIRST_PID,
                rng: StdRng::seed_from_u64(1),
                jitter: 0.0,
            }),
            formulas,
            thread_memory,
        }
    }

    /// Build the cluster described by the `[sim]` section. The target is
    /// registered under `[scheduler] target`.
    pub fn from_config(config: &GridConfig) -> Self {
        let sim = &config.sim;
        let cluster = Self::new(SimFormulas::from_config(&sim.target), config.allocator.block_size)
            .with_seed(sim.seed)
            .with_jitter(sim.jitter);
        for host in &sim.hosts {
            cluster.add_host(&host.id, host.memory);
        }
        cluster.set_target(
            &config.scheduler.target,
            TargetState {
                difficulty: sim.target.difficulty,
                floor: sim.target.floor,
                yield_amount: sim.target.yield_amount,
                ceiling: sim.target.ceiling,
            },
        );
        cluster
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.lock().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Relative duration noise: each worker runs `1 ± jitter` times its
    /// formula duration.
    pub fn with_jitter(self, jitter: f64) -> Self {
        self.lock().jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    pub fn formulas(&self) -> Arc<dyn Formulas> {
        Arc::clone(&self.formulas)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a host, or change the memory of an existing one.
    pub fn add_host(&self, host_id: &str, memory: f64) {
        let mut state = self.lock();
        state
            .hosts
            .entry(host_id.to_string())
            .and_modify(|h| h.memory = memory)
            .or_insert(SimHost { memory, used: 0.0 });
    }

    pub fn set_target(&self, name: &str, target: TargetState) {
        self.lock().targets.insert(name.to_string(), target);
    }

    /// Start a process with no workload, e.g. to stand in for an
    /// allocator client.
    pub fn register_owner(&self) -> Pid {
        let mut state = self.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(pid, SimProcess::Owner);
        pid
    }

    /// Workers still running.
    pub fn running(&self) -> usize {
        let mut state = self.lock();
        self.settle(&mut state, Instant::now());
        state
            .processes
            .values()
            .filter(|p| matches!(p, SimProcess::Worker(_)))
            .count()
    }

    pub fn host_memory_used(&self, host_id: &str) -> Option<f64> {
        let mut state = self.lock();
        self.settle(&mut state, Instant::now());
        state.hosts.get(host_id).map(|h| h.used)
    }

    /// Completed workers, in completion order.
    pub fn completions(&self) -> Vec<Completion> {
        let mut state = self.lock();
        self.settle(&mut state, Instant::now());
        state.completions.clone()
    }

    /// Finish every worker due by `now` and apply its effect.
    fn settle(&self, state: &mut SimState, now: Instant) {
        let mut due: Vec<(Instant, Pid)> = state
            .processes
            .iter()
            .filter_map(|(pid, p)| match p {
                SimProcess::Worker(w) if w.finish_at <= now => Some((w.finish_at, *pid)),
                _ => None,
            })
            .collect();
        due.sort_unstable();

        for (finished_at, pid) in due {
            let Some(SimProcess::Worker(worker)) = state.processes.remove(&pid) else {
                continue;
            };
            if let Some(host) = state.hosts.get_mut(&worker.spec.host_id) {
                host.used = (host.used - worker.memory).max(0.0);
            }
            if let Some(target) = state.targets.get_mut(&worker.spec.target) {
                apply_effect(self.formulas.as_ref(), target, worker.spec.worker, worker.spec.threads);
                trace!(
                    pid,
                    worker = worker.spec.worker.label(),
                    threads = worker.spec.threads,
                    difficulty = target.difficulty,
                    yield_amount = target.yield_amount,
                    "worker finished"
                );
            }
            state.completions.push(Completion {
                pid,
                worker: worker.spec.worker,
                host_id: worker.spec.host_id,
                threads: worker.spec.threads,
                target: worker.spec.target,
                args: worker.spec.args,
                finished_at,
            });
        }
    }
}

fn apply_effect(formulas: &dyn Formulas, target: &mut TargetState, worker: WorkerKind, threads: u32) {
    let effects = formulas.effects();
    let units = f64::from(threads);
    match worker {
        WorkerKind::Extract => {
            let fraction = (formulas.extraction_fraction_per_unit(target) * units).min(1.0);
            target.yield_amount -= target.yield_amount * fraction;
            target.difficulty = (target.difficulty + effects.primary * units).min(MAX_DIFFICULTY);
        }
        WorkerKind::Replenish => {
            target.yield_amount = formulas.yield_after_secondary(target, threads);
            target.difficulty = (target.difficulty + effects.secondary * units).min(MAX_DIFFICULTY);
        }
        WorkerKind::Correct => {
            target.difficulty = (target.difficulty - effects.corrective * units).max(target.floor);
        }
    }
}

impl HostInventory for SimCluster {
    fn scan(&self) -> Vec<HostCapacity> {
        self.lock()
            .hosts
            .iter()
            .map(|(id, host)| HostCapacity {
                host_id: id.clone(),
                memory: host.memory,
                reserved_memory: 0.0,
            })
            .collect()
    }
}

impl ProcessControl for SimCluster {
    fn launch(&self, spec: &LaunchSpec) -> Result<Pid, LaunchError> {
        if spec.threads == 0 {
            return Err(LaunchError::Rejected("zero threads".into()));
        }
        let now = Instant::now();
        let mut state = self.lock();
        self.settle(&mut state, now);

        let needed = self.thread_memory * f64::from(spec.threads);
        let host = state
            .hosts
            .get(&spec.host_id)
            .ok_or_else(|| LaunchError::UnknownHost(spec.host_id.clone()))?;
        let free = host.memory - host.used;
        if needed > free + 1e-9 {
            return Err(LaunchError::InsufficientMemory {
                host: spec.host_id.clone(),
                needed,
                free,
            });
        }
        let target = state
            .targets
            .get(&spec.target)
            .copied()
            .ok_or_else(|| LaunchError::Rejected(format!("unknown target {}", spec.target)))?;

        let mut duration = self.formulas.duration(spec.worker, &target);
        if state.jitter > 0.0 {
            let jitter = state.jitter;
            let noise: f64 = state.rng.random_range(-jitter..=jitter);
            duration = duration.mul_f64(1.0 + noise);
        }

        if let Some(host) = state.hosts.get_mut(&spec.host_id) {
            host.used += needed;
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            SimProcess::Worker(SimWorker {
                spec: spec.clone(),
                memory: needed,
                finish_at: now + duration,
            }),
        );
        debug!(
            pid,
            worker = spec.worker.label(),
            host = %spec.host_id,
            threads = spec.threads,
            duration_ms = duration.as_millis() as u64,
            "worker launched"
        );
        Ok(pid)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        let mut state = self.lock();
        self.settle(&mut state, Instant::now());
        state.processes.contains_key(&pid)
    }

    fn kill(&self, pid: Pid) -> bool {
        let mut state = self.lock();
        self.settle(&mut state, Instant::now());
        match state.processes.remove(&pid) {
            Some(SimProcess::Worker(worker)) => {
                if let Some(host) = state.hosts.get_mut(&worker.spec.host_id) {
                    host.used = (host.used - worker.memory).max(0.0);
                }
                debug!(pid, "worker killed");
                true
            }
            Some(SimProcess::Owner) => true,
            None => false,
        }
    }
}

impl TargetSource for SimCluster {
    fn observe(&self, target: &str) -> Option<TargetState> {
        let mut state = self.lock();
        self.settle(&mut state, Instant::now());
        state.targets.get(target).copied()
    }
}
