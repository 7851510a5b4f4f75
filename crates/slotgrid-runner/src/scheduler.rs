//! Scheduling loop.
//!
//! Repeatedly sizes a batch against the capacity the allocator reports,
//! starts it on the runner and advances the anchor and the shadow target
//! state without waiting for the batch to finish. Finished batches are
//! collected from a `JoinSet` and folded into [`RunMetrics`].

use std::time::Duration;

use slot_core::TargetState;
use slot_core::config::SchedulerConfig;
use slotgrid_planner::{Budget, plan, plan_four_stage, project};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::{RunMetrics, RunSummary, StopReason};
use crate::runner::{BatchReport, BatchRunner, raised};
use crate::timeline::earliest_start;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Pause after a scheduling attempt finds no capacity.
    pub oom_delay: Duration,
    /// Minimum spacing between repeated out-of-memory warnings.
    pub oom_warn_interval: Duration,
    pub status_interval: Duration,
    pub extraction_fraction: f64,
    pub max_batches: Option<u64>,
    /// Run even when a full batch cannot fit.
    pub force: bool,
    /// Stop once the target is at floor and ceiling.
    pub prep: bool,
}

impl LoopSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            oom_delay: config.oom_delay(),
            oom_warn_interval: config.oom_warn_interval(),
            status_interval: config.status_interval(),
            extraction_fraction: config.extraction_fraction,
            max_batches: config.max_batches,
            force: config.force,
            prep: config.prep,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Rate limiter for out-of-memory warnings.
#[derive(Debug)]
struct OomWarnings {
    interval: Duration,
    last_warned: Option<Instant>,
    suppressed: u64,
}

impl OomWarnings {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_warned: None,
            suppressed: 0,
        }
    }

    /// Record one event. Returns the number of events suppressed since the
    /// previous warning when a warning is due now.
    fn hit(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last_warned
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last_warned = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }

    fn reset(&mut self) {
        self.last_warned = None;
        self.suppressed = 0;
    }
}

pub struct SchedulingLoop {
    runner: BatchRunner,
    settings: LoopSettings,
}

impl SchedulingLoop {
    pub fn new(runner: BatchRunner, settings: LoopSettings) -> Self {
        Self { runner, settings }
    }

    pub fn runner(&self) -> &BatchRunner {
        &self.runner
    }

    /// Check that a full Four-stage batch against the prepared target fits
    /// the capacity currently available. Returns the observed state.
    pub async fn preflight(&self) -> SchedulerResult<TargetState> {
        let target = &self.runner.settings().target;
        let state = self
            .runner
            .observe_target()
            .ok_or_else(|| SchedulerError::UnknownTarget(target.clone()))?;

        let reference = state.with_difficulty(state.floor).with_yield(state.ceiling);
        let full = plan_four_stage(
            &reference,
            self.runner.formulas(),
            Budget::Unlimited,
            self.settings.extraction_fraction,
        )?;
        let needed = full.batch.map_or(0, |b| b.total_units());
        let available = self.available_units().await?;

        if needed > available {
            if !self.settings.force {
                return Err(SchedulerError::InsufficientCapacity { needed, available });
            }
            warn!(%target, needed, available, "a full batch does not fit; continuing anyway");
        } else {
            debug!(%target, needed, available, "pre-flight capacity check passed");
        }
        Ok(state)
    }

    async fn available_units(&self) -> SchedulerResult<u64> {
        let settings = self.runner.settings();
        Ok(self
            .runner
            .client()
            .available_units(settings.unit_size, settings.host_filter.clone())
            .await?)
    }

    /// Run until shutdown, the batch limit, or (in prep mode) a prepared
    /// target. In-flight batches are drained before the summary is built.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<RunSummary> {
        let started = Instant::now();
        let mut shadow = self.preflight().await?;
        let target = self.runner.settings().target.clone();
        let skew = self.runner.settings().skew;

        let mut metrics = RunMetrics::default();
        let mut in_flight: JoinSet<BatchReport> = JoinSet::new();
        let mut oom = OomWarnings::new(self.settings.oom_warn_interval);
        let mut anchor = Instant::now();
        let mut next_status = Instant::now() + self.settings.status_interval;
        let mut next_batch_id: u64 = 1;

        info!(
            %target,
            difficulty = shadow.difficulty,
            yield_amount = shadow.yield_amount,
            prep = self.settings.prep,
            max_batches = ?self.settings.max_batches,
            "scheduling loop started"
        );

        let stop_reason = loop {
            while let Some(done) = in_flight.try_join_next() {
                collect(done, &mut metrics);
            }
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }
            if in_flight.is_empty() {
                shadow = self.runner.observe(&shadow);
            }

            let now = Instant::now();
            if now >= next_status {
                self.log_status(&shadow, &metrics).await;
                next_status = now + self.settings.status_interval;
            }

            if self.settings.prep && shadow.is_prepared() {
                if in_flight.is_empty() {
                    break StopReason::Prepared;
                }
                self.idle(next_status, &mut in_flight, &mut metrics, &mut shutdown).await;
                continue;
            }
            if let Some(max) = self.settings.max_batches
                && metrics.queued >= max
            {
                break StopReason::MaxBatches;
            }

            let corrective = self.runner.durations(&shadow).corrective;
            let start_at = earliest_start(anchor, skew, corrective);
            if start_at > now {
                self.idle(start_at.min(next_status), &mut in_flight, &mut metrics, &mut shutdown)
                    .await;
                continue;
            }

            let budget = match self.available_units().await {
                Ok(units) => units,
                Err(e) => {
                    error!(error = %e, "failed to query capacity");
                    self.idle(now + self.settings.oom_delay, &mut in_flight, &mut metrics, &mut shutdown)
                        .await;
                    continue;
                }
            };

            let planned = plan(
                &shadow,
                self.runner.formulas(),
                Budget::Units(budget),
                self.settings.extraction_fraction,
            );
            let batch = match planned {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    metrics.oom_events += 1;
                    if let Some(suppressed) = oom.hit(now) {
                        warn!(%target, available = budget, suppressed, "no batch fits available capacity");
                    }
                    self.idle(now + self.settings.oom_delay, &mut in_flight, &mut metrics, &mut shutdown)
                        .await;
                    continue;
                }
                Err(e) => {
                    metrics.plan_errors += 1;
                    error!(%target, error = %e, "planning failed");
                    self.idle(now + self.settings.oom_delay, &mut in_flight, &mut metrics, &mut shutdown)
                        .await;
                    continue;
                }
            };

            let batch_id = next_batch_id;
            match self.runner.start(batch_id, &batch, anchor, &shadow, shutdown.clone()).await {
                Ok(handle) => {
                    next_batch_id += 1;
                    metrics.queued += 1;
                    oom.reset();
                    anchor = handle.anchor;
                    shadow = project(&shadow, &batch, self.runner.formulas());
                    info!(
                        batch_id,
                        shape = %batch.shape,
                        units = batch.total_units(),
                        available = budget,
                        %batch,
                        "batch scheduled"
                    );
                    in_flight.spawn(handle.finish());
                }
                Err(e) if e.is_out_of_memory() => {
                    metrics.oom_events += 1;
                    if let Some(suppressed) = oom.hit(now) {
                        warn!(%target, batch_id, error = %e, suppressed, "batch reservation rejected");
                    }
                    self.idle(now + self.settings.oom_delay, &mut in_flight, &mut metrics, &mut shutdown)
                        .await;
                }
                Err(e) => {
                    error!(%target, batch_id, error = %e, "failed to start batch");
                    self.idle(now + self.settings.oom_delay, &mut in_flight, &mut metrics, &mut shutdown)
                        .await;
                }
            }
        };

        info!(%target, reason = %stop_reason, in_flight = in_flight.len(), "scheduling stopped, draining");
        while let Some(done) = in_flight.join_next().await {
            collect(done, &mut metrics);
        }

        let summary = RunSummary {
            target,
            stop_reason,
            elapsed: started.elapsed(),
            final_state: self.runner.observe_target(),
            metrics,
        };
        info!("{summary}");
        Ok(summary)
    }

    /// Wait until `until`, the next batch completion or shutdown.
    async fn idle(
        &self,
        until: Instant,
        in_flight: &mut JoinSet<BatchReport>,
        metrics: &mut RunMetrics,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = sleep_until(until) => {}
            Some(done) = in_flight.join_next() => collect(done, metrics),
            _ = raised(shutdown) => {}
        }
    }

    async fn log_status(&self, shadow: &TargetState, metrics: &RunMetrics) {
        let capacity = match self.runner.client().status().await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(error = %e, "capacity status unavailable");
                None
            }
        };
        let state = self.runner.observe(shadow);
        info!(
            target = %self.runner.settings().target,
            difficulty = state.difficulty,
            floor = state.floor,
            yield_ratio = state.yield_ratio(),
            available = capacity.map(|c| c.available),
            total = capacity.map(|c| c.total),
            in_flight = metrics.in_flight(),
            finished = metrics.finished,
            "status"
        );
    }
}

fn collect(done: Result<BatchReport, JoinError>, metrics: &mut RunMetrics) {
    match done {
        Ok(report) => metrics.record(&report),
        Err(e) => {
            metrics.finished += 1;
            error!(error = %e, "batch task failed");
        }
    }
}
