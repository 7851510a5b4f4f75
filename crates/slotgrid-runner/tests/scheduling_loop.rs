//! End-to-end scheduling against the simulated cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use slot_core::{Formulas, TargetState, WorkerKind};
use slotgrid_alloc::{AllocatorService, AllocatorSettings, ClientSettings};
use slotgrid_ledger::HostFilter;
use slotgrid_runner::{BatchRunner, LoopSettings, RunnerSettings, SchedulingLoop, StopReason};
use slotgrid_sim::{SimCluster, SimFormulas};
use tokio::sync::watch;

struct Env {
    sim: Arc<SimCluster>,
    scheduler: SchedulingLoop,
    _allocator_shutdown: watch::Sender<bool>,
}

const HOSTS: &[(&str, f64)] = &[("home", 64.0), ("node-1", 256.0), ("node-2", 160.0)];

fn env(hosts: &[(&str, f64)], target: TargetState, settings: LoopSettings) -> Env {
    let formulas: Arc<dyn Formulas> = Arc::new(SimFormulas::new(Duration::from_millis(100), 0.0025, 0.004));
    let sim = Arc::new(SimCluster::with_formulas(Arc::clone(&formulas), 1.0));
    for (id, memory) in hosts {
        sim.add_host(id, *memory);
    }
    sim.set_target("srv", target);

    let (allocator_shutdown, shutdown_rx) = watch::channel(false);
    let allocator = AllocatorSettings {
        block_size: 1.0,
        housekeeping_period: Duration::from_secs(5),
        privileged_host: Some("home".into()),
        reserved: HashMap::new(),
        response_cache: 256,
    };
    let (handle, _join) = AllocatorService::new(allocator, sim.clone(), sim.clone()).spawn(shutdown_rx);
    let client = Arc::new(handle.client(sim.register_owner(), ClientSettings::default()));

    let runner = BatchRunner::new(
        client,
        sim.clone(),
        sim.clone(),
        formulas,
        RunnerSettings {
            target: "srv".into(),
            host_filter: HostFilter::ExcludePrivileged,
            ..RunnerSettings::default()
        },
    );
    Env {
        sim,
        scheduler: SchedulingLoop::new(runner, settings),
        _allocator_shutdown: allocator_shutdown,
    }
}

fn prepared() -> TargetState {
    TargetState {
        difficulty: 2.0,
        floor: 2.0,
        yield_amount: 1_000_000.0,
        ceiling: 1_000_000.0,
    }
}

#[tokio::test(start_paused = true)]
async fn prep_mode_brings_target_to_floor_and_ceiling() {
    let env = env(
        HOSTS,
        TargetState {
            difficulty: 4.0,
            yield_amount: 900_000.0,
            ..prepared()
        },
        LoopSettings {
            prep: true,
            max_batches: Some(20),
            ..LoopSettings::default()
        },
    );
    let sim = env.sim.clone();
    let (_stop, stop_rx) = watch::channel(false);

    let summary = env.scheduler.run(stop_rx).await.unwrap();

    assert_eq!(summary.stop_reason, StopReason::Prepared);
    assert!(summary.final_state.is_some_and(|s| s.is_prepared()));
    assert_eq!(summary.metrics.finished, summary.metrics.queued);
    // never extracted while preparing
    assert!(sim.completions().iter().all(|c| c.worker != WorkerKind::Extract));
    assert!(sim.completions().iter().all(|c| c.host_id != "home"));
    assert_eq!(sim.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn batch_limit_drains_in_flight_batches() {
    let env = env(
        HOSTS,
        prepared(),
        LoopSettings {
            max_batches: Some(2),
            ..LoopSettings::default()
        },
    );
    let sim = env.sim.clone();
    let (_stop, stop_rx) = watch::channel(false);

    let summary = env.scheduler.run(stop_rx).await.unwrap();

    assert_eq!(summary.stop_reason, StopReason::MaxBatches);
    assert_eq!(summary.metrics.queued, 2);
    assert_eq!(summary.metrics.finished, 2);
    assert_eq!(summary.metrics.success, 2);
    assert_eq!(summary.metrics.primary.ok, 2);
    assert_eq!(summary.metrics.secondary.ok, 2);
    assert!(summary.final_state.is_some_and(|s| s.is_prepared()));

    // the second batch starts only after the first one's last corrective
    let workers: Vec<_> = sim
        .completions()
        .iter()
        .map(|c| c.worker)
        .filter(|w| *w != WorkerKind::Correct)
        .collect();
    assert_eq!(
        workers,
        [
            WorkerKind::Extract,
            WorkerKind::Replenish,
            WorkerKind::Extract,
            WorkerKind::Replenish
        ]
    );
    assert_eq!(sim.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn no_capacity_backs_off_until_shutdown() {
    // the only host is privileged and excluded from the budget
    let env = env(
        &[("home", 64.0)],
        TargetState {
            difficulty: 2.5,
            ..prepared()
        },
        LoopSettings {
            force: true,
            ..LoopSettings::default()
        },
    );
    let sim = env.sim.clone();
    let (stop, stop_rx) = watch::channel(false);
    let run = tokio::spawn(env.scheduler.run(stop_rx));

    tokio::time::sleep(Duration::from_secs(30)).await;
    stop.send(true).unwrap();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.stop_reason, StopReason::Shutdown);
    assert_eq!(summary.metrics.queued, 0);
    assert!(summary.metrics.oom_events >= 5, "{}", summary.metrics.oom_events);
    assert!(sim.completions().is_empty());
}
