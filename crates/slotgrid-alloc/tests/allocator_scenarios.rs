use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use slot_core::{ProcessControl, WorkerKind};
use slotgrid_alloc::{
    AllocError, AllocatorService, AllocatorSettings, ClientSettings, launch_pinned,
};
use slotgrid_ledger::{AllocationRequest, HostFilter};
use slotgrid_sim::{SimCluster, SimFormulas};
use tokio::sync::watch;

fn unit_settings() -> AllocatorSettings {
    AllocatorSettings {
        block_size: 1.0,
        housekeeping_period: Duration::from_secs(5),
        privileged_host: Some("home".into()),
        reserved: HashMap::new(),
        response_cache: 64,
    }
}

fn cluster(hosts: &[(&str, f64)]) -> Arc<SimCluster> {
    let cluster = SimCluster::new(SimFormulas::default(), 1.0);
    for (id, memory) in hosts {
        cluster.add_host(id, *memory);
    }
    Arc::new(cluster)
}

#[tokio::test(start_paused = true)]
async fn split_across_hosts_then_free() {
    let sim = cluster(&[("A", 100.0), ("B", 50.0)]);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = AllocatorService::new(unit_settings(), sim.clone(), sim.clone());
    let (handle, _join) = service.spawn(shutdown_rx);

    let owner = sim.register_owner();
    let client = handle.client(owner, ClientSettings::default());

    let reservation = client.alloc(AllocationRequest::new(120, 1)).await.unwrap();
    let split: Vec<(&str, u32)> = reservation
        .grants
        .iter()
        .map(|g| (g.host_id.as_str(), g.units))
        .collect();
    assert_eq!(split, vec![("A", 100), ("B", 20)]);
    assert_eq!(client.status().await.unwrap().available, 30);

    // Too much for what is left: rejected, nothing changes.
    let err = client.alloc(AllocationRequest::new(31, 1)).await.unwrap_err();
    assert_eq!(
        err,
        AllocError::Rejected {
            requested: 31,
            available: 30
        }
    );

    client.release(&reservation).await.unwrap();
    // Releasing twice is harmless.
    client.release(&reservation).await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.available, 150);
    assert_eq!(status.available, status.total - status.reserved);
}

#[tokio::test(start_paused = true)]
async fn dead_owner_reclaimed_on_next_housekeeping() {
    let sim = cluster(&[("A", 50.0)]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = AllocatorService::new(unit_settings(), sim.clone(), sim.clone());
    let (handle, join) = service.spawn(shutdown_rx);

    let owner = sim.register_owner();
    let client = handle.client(owner, ClientSettings::default());
    client.alloc(AllocationRequest::new(10, 1)).await.unwrap();
    assert_eq!(client.available_units(1, HostFilter::Any).await.unwrap(), 40);

    sim.kill(owner);
    tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;

    let observer = handle.client(sim.register_owner(), ClientSettings::default());
    assert_eq!(observer.available_units(1, HostFilter::Any).await.unwrap(), 50);

    shutdown_tx.send(true).unwrap();
    let ledger = join.await.unwrap();
    assert!(ledger.owners().is_empty());
    assert!(ledger.check_invariants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn host_growth_is_picked_up() {
    let sim = cluster(&[("A", 10.0)]);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = AllocatorService::new(unit_settings(), sim.clone(), sim.clone());
    let (handle, _join) = service.spawn(shutdown_rx);
    let client = handle.client(sim.register_owner(), ClientSettings::default());

    assert!(client.alloc(AllocationRequest::new(20, 1)).await.is_err());

    sim.add_host("A", 30.0);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(client.alloc(AllocationRequest::new(20, 1)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn workers_launch_on_granted_hosts() {
    let sim = cluster(&[("A", 4.0), ("B", 4.0)]);
    sim.set_target(
        "t",
        slot_core::TargetState {
            difficulty: 5.0,
            floor: 1.0,
            yield_amount: 10.0,
            ceiling: 10.0,
        },
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = AllocatorService::new(unit_settings(), sim.clone(), sim.clone());
    let (handle, _join) = service.spawn(shutdown_rx);
    let client = handle.client(sim.register_owner(), ClientSettings::default());

    let reservation = client.alloc(AllocationRequest::new(6, 1)).await.unwrap();
    let pids = launch_pinned(sim.as_ref(), &reservation, WorkerKind::Correct, "t", &[]).unwrap();
    assert_eq!(pids.len(), 2);
    assert_eq!(sim.running(), 2);
    assert!(pids.iter().all(|pid| sim.is_alive(*pid)));
}

#[tokio::test(start_paused = true)]
async fn failed_launch_kills_started_workers() {
    // The ledger thinks B has room, the host disagrees.
    let sim = cluster(&[("A", 4.0), ("B", 4.0)]);
    sim.set_target(
        "t",
        slot_core::TargetState {
            difficulty: 5.0,
            floor: 1.0,
            yield_amount: 10.0,
            ceiling: 10.0,
        },
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = AllocatorService::new(unit_settings(), sim.clone(), sim.clone());
    let (handle, _join) = service.spawn(shutdown_rx);
    let client = handle.client(sim.register_owner(), ClientSettings::default());
    let reservation = client.alloc(AllocationRequest::new(8, 1)).await.unwrap();

    sim.add_host("B", 1.0);
    let err = launch_pinned(sim.as_ref(), &reservation, WorkerKind::Correct, "t", &[]).unwrap_err();
    assert!(matches!(err, AllocError::Launch(_)));
    assert_eq!(sim.running(), 0);
}
