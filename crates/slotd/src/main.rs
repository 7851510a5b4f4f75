//! slotd: the slotgrid daemon.
//!
//! Assembles the capacity allocator and the batch scheduler against the
//! simulated cluster described by the `[sim]` config section.
//!
//! # Usage
//!
//! ```text
//! slotd run --config slotgrid.toml --max-batches 20
//! slotd plan --config slotgrid.toml
//! slotd config > slotgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use slot_core::{GridConfig, ProcessControl, TargetSource, parse_duration};
use slotgrid_alloc::{AllocatorService, AllocatorSettings, ClientSettings};
use slotgrid_planner::{Budget, plan_detailed, plan_four_stage};
use slotgrid_runner::{BatchRunner, LoopSettings, RunSummary, RunnerSettings, SchedulingLoop};
use slotgrid_sim::SimCluster;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,slotd=debug,slotgrid=debug";

#[derive(Parser)]
#[command(name = "slotd", about = "slotgrid capacity allocator and batch scheduler")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the allocator and the scheduling loop.
    Run {
        /// Path to slotgrid.toml (defaults apply when omitted).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Start even if a full batch does not fit the cluster.
        #[arg(long)]
        force: bool,

        /// Stop once the target is at floor and ceiling.
        #[arg(long)]
        prep: bool,

        /// Stop scheduling after this many batches.
        #[arg(long)]
        max_batches: Option<u64>,

        /// Shut down after this long, e.g. "90s" or "10m".
        #[arg(long, value_parser = parse_run_for)]
        run_for: Option<Duration>,
    },
    /// Print the batch that would be scheduled next, as JSON.
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    Config,
}

fn parse_run_for(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration: {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            force,
            prep,
            max_batches,
            run_for,
        } => {
            let mut config = load_config(config.as_deref())?;
            apply_overrides(&mut config, force, prep, max_batches);
            let summary = run(config, run_for).await?;
            println!("{summary}");
            Ok(())
        }
        Command::Plan { config } => {
            let config = load_config(config.as_deref())?;
            let report = plan_report(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Config => {
            print!("{}", GridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GridConfig> {
    match path {
        Some(path) => {
            GridConfig::from_file(path).with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => Ok(GridConfig::default()),
    }
}

/// CLI flags win over the file.
fn apply_overrides(config: &mut GridConfig, force: bool, prep: bool, max_batches: Option<u64>) {
    config.scheduler.force |= force;
    config.scheduler.prep |= prep;
    if max_batches.is_some() {
        config.scheduler.max_batches = max_batches;
    }
}

async fn run(config: GridConfig, run_for: Option<Duration>) -> anyhow::Result<RunSummary> {
    info!(
        target = %config.scheduler.target,
        hosts = config.sim.hosts.len(),
        "slotgrid daemon starting"
    );

    let sim = Arc::new(SimCluster::from_config(&config));
    // The scheduler stops first so its stages can still release capacity.
    let (stop_tx, stop_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Allocator ──────────────────────────────────────────────

    let allocator = AllocatorService::new(
        AllocatorSettings::from_config(&config.allocator),
        sim.clone(),
        sim.clone(),
    );
    let status = allocator.ledger().status();
    info!(
        total = status.total,
        reserved = status.reserved,
        available = status.available,
        "allocator initialized"
    );
    let (handle, allocator_task) = allocator.spawn(shutdown_rx);

    // ── Scheduler ──────────────────────────────────────────────

    let owner = sim.register_owner();
    let client = Arc::new(handle.client(owner, ClientSettings::from_config(&config.allocator)));
    let runner = BatchRunner::new(
        client,
        sim.clone(),
        sim.clone(),
        sim.formulas(),
        RunnerSettings::from_config(&config.scheduler),
    );
    let scheduler = SchedulingLoop::new(runner, LoopSettings::from_config(&config.scheduler));
    let mut scheduler_task = tokio::spawn(scheduler.run(stop_rx));

    // ── Shutdown ───────────────────────────────────────────────

    let deadline = async {
        match run_for {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    let finished = tokio::select! {
        result = &mut scheduler_task => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            None
        }
        _ = deadline => {
            info!("run time elapsed");
            None
        }
    };
    stop_tx.send_replace(true);
    let result = match finished {
        Some(result) => result,
        None => scheduler_task.await,
    };
    shutdown_tx.send_replace(true);

    let ledger = allocator_task.await.context("allocator task failed")?;
    let leftover = ledger.live_allocations();
    if leftover > 0 {
        warn!(leftover, "allocations still live at shutdown");
    }
    sim.kill(owner);

    let summary = result.context("scheduler task failed")??;
    info!("slotgrid daemon stopped");
    Ok(summary)
}

/// Next batch for the configured target, plus the size of a full batch.
fn plan_report(config: &GridConfig) -> anyhow::Result<serde_json::Value> {
    let sim = Arc::new(SimCluster::from_config(config));
    let target = &config.scheduler.target;
    let state = sim
        .observe(target)
        .with_context(|| format!("target {target} not found"))?;

    let allocator = AllocatorService::new(
        AllocatorSettings::from_config(&config.allocator),
        sim.clone(),
        sim.clone(),
    );
    let runner_settings = RunnerSettings::from_config(&config.scheduler);
    let available = allocator
        .ledger()
        .available_units(runner_settings.unit_size, &runner_settings.host_filter);

    let formulas = sim.formulas();
    let fraction = config.scheduler.extraction_fraction;
    let next = plan_detailed(&state, formulas.as_ref(), Budget::Units(available), fraction)?;
    let reference = state.with_difficulty(state.floor).with_yield(state.ceiling);
    let full = plan_four_stage(&reference, formulas.as_ref(), Budget::Unlimited, fraction)?;

    Ok(serde_json::json!({
        "target": target,
        "state": state,
        "available_units": available,
        "next_batch": next.batch,
        "trials": next.trials,
        "full_batch_units": full.batch.map(|b| b.total_units()),
    }))
}
