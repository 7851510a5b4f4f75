//! Batch runner: reserves, launches and verifies one batch.
//!
//! `start` does everything that can fail for lack of capacity up front:
//! it reserves every stage and computes the timeline, then hands each
//! stage to its own task. A rejection releases whatever was already
//! reserved and surfaces to the caller as an out-of-memory condition.
//!
//! Stage tasks never fail; they end `Completed` or `Aborted` and the
//! batch is classified from what they report.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use slot_core::config::SchedulerConfig;
use slot_core::{Formulas, OperationKind, ProcessControl, TargetSource, TargetState};
use slotgrid_alloc::{AllocatorClient, Reservation, launch_pinned};
use slotgrid_ledger::{AllocationRequest, HostFilter};
use slotgrid_planner::{Batch, BatchShape};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;
use crate::stage::{AbortReason, StageReport, StageState};
use crate::timeline::{StageDurations, StageTiming, Timeline, Window};

/// Runner settings, usually derived from `[scheduler]` config.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub target: String,
    /// `S`: spacing between corrective completions.
    pub skew: Duration,
    /// `G`: margin kept inside every execution window.
    pub guard: Duration,
    /// Liveness polling interval for running workers.
    pub poll_interval: Duration,
    /// Share of the remaining gap slept per deferred back-off step.
    pub backoff_fraction: f64,
    pub min_backoff: Duration,
    pub host_filter: HostFilter,
    /// Capacity blocks per worker thread.
    pub unit_size: u32,
}

impl RunnerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            target: config.target.clone(),
            skew: config.skew(),
            guard: config.guard(),
            poll_interval: config.poll_interval(),
            backoff_fraction: config.backoff_fraction,
            min_backoff: config.min_backoff(),
            host_filter: if config.include_privileged {
                HostFilter::Any
            } else {
                HostFilter::ExcludePrivileged
            },
            unit_size: 1,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Every stage completed in canonical order.
    Success,
    /// At least one stage aborted.
    Partial,
    /// Every stage completed, but not in canonical order.
    OutOfOrder,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::OutOfOrder => "out-of-order",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_id: u64,
    pub shape: BatchShape,
    /// Stage ordinals in the order completions were observed.
    pub observed_order: String,
    pub canonical_order: String,
    pub classification: Classification,
    pub stages: Vec<StageReport>,
}

impl BatchReport {
    pub fn aborted_stages(&self) -> Vec<(OperationKind, AbortReason)> {
        self.stages
            .iter()
            .filter_map(|s| s.abort_reason.map(|r| (s.kind, r)))
            .collect()
    }

    pub fn stage(&self, kind: OperationKind) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.kind == kind)
    }
}

/// Shared collaborators of every stage task.
#[derive(Clone)]
pub struct BatchRunner {
    client: Arc<AllocatorClient>,
    processes: Arc<dyn ProcessControl>,
    targets: Arc<dyn TargetSource>,
    formulas: Arc<dyn Formulas>,
    settings: Arc<RunnerSettings>,
    /// Largest volatility increase any started batch may cause.
    max_increase: Arc<Mutex<f64>>,
}

impl BatchRunner {
    pub fn new(
        client: Arc<AllocatorClient>,
        processes: Arc<dyn ProcessControl>,
        targets: Arc<dyn TargetSource>,
        formulas: Arc<dyn Formulas>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            client,
            processes,
            targets,
            formulas,
            settings: Arc::new(settings),
            max_increase: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn client(&self) -> &AllocatorClient {
        &self.client
    }

    pub fn formulas(&self) -> &dyn Formulas {
        self.formulas.as_ref()
    }

    pub fn observe_target(&self) -> Option<TargetState> {
        self.targets.observe(&self.settings.target)
    }

    /// Live target state, or `fallback` when the target cannot be seen.
    pub fn observe(&self, fallback: &TargetState) -> TargetState {
        self.observe_target().unwrap_or(*fallback)
    }

    pub fn durations(&self, state: &TargetState) -> StageDurations {
        StageDurations::from_formulas(self.formulas.as_ref(), state)
    }

    /// Volatility increase deferred stages assume when backing off. Covers
    /// every batch started so far, including ones still in flight.
    pub fn worst_case_increase(&self) -> f64 {
        *self.max_increase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raise_worst_case(&self, increase: f64) -> f64 {
        let mut max = self.max_increase.lock().unwrap_or_else(PoisonError::into_inner);
        if increase > *max {
            *max = increase;
        }
        *max
    }

    /// Reserve capacity for `batch`, lay out its timeline after
    /// `previous_anchor` and start one task per stage.
    pub async fn start(
        &self,
        batch_id: u64,
        batch: &Batch,
        previous_anchor: Instant,
        shadow: &TargetState,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<BatchHandle> {
        let stages: Vec<_> = batch.stages.iter().filter(|s| s.units > 0).collect();

        let mut reserved: Vec<(StageReport, Reservation)> = Vec::with_capacity(stages.len());
        for stage in &stages {
            let mut report = StageReport::new(stage.kind, stage.units);
            report.advance(StageState::AllocationRequested);
            let request = AllocationRequest::new(stage.units, self.settings.unit_size)
                .with_filter(self.settings.host_filter.clone());
            match self.client.alloc(request).await {
                Ok(reservation) => {
                    report.advance(StageState::Allocated);
                    reserved.push((report, reservation));
                }
                Err(e) => {
                    report.advance(StageState::Rejected);
                    debug!(
                        batch_id,
                        stage = stage.kind.label(),
                        state = %report.state,
                        error = %e,
                        "stage reservation failed"
                    );
                    for (_, reservation) in &reserved {
                        self.release(batch_id, reservation).await;
                    }
                    return Err(e.into());
                }
            }
        }

        let state = self.observe(shadow);
        let now = Instant::now();
        let durations = self.durations(&state);
        let timeline = Timeline::compute(
            batch.shape,
            previous_anchor,
            now,
            &durations,
            self.settings.skew,
            self.settings.guard,
        );
        debug!(
            batch_id,
            shape = %batch.shape,
            end_in_ms = timeline.end.saturating_duration_since(now).as_millis() as u64,
            anchor_in_ms = timeline.anchor.saturating_duration_since(now).as_millis() as u64,
            primary_ms = durations.primary.as_millis() as u64,
            secondary_ms = durations.secondary.as_millis() as u64,
            corrective_ms = durations.corrective.as_millis() as u64,
            "batch timeline"
        );

        let effects = self.formulas.effects();
        let worst_case_increase = self.raise_worst_case(
            effects.increase(OperationKind::Primary, batch.units(OperationKind::Primary))
                + effects.increase(OperationKind::Secondary, batch.units(OperationKind::Secondary)),
        );

        let canonical_order: String = reserved
            .iter()
            .filter_map(|(r, _)| batch.shape.ordinal(r.kind))
            .map(|o| o.to_string())
            .collect();
        let order = Arc::new(Mutex::new(String::new()));
        // Secondary aborting invalidates a Primary that has not launched.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let mut tasks = Vec::with_capacity(reserved.len());
        for (report, reservation) in reserved {
            let Some(timing) = timeline.timing(report.kind) else {
                continue;
            };
            let kind = report.kind;
            let task = StageTask {
                runner: self.clone(),
                batch_id,
                ordinal: batch.shape.ordinal(kind).unwrap_or(0),
                timing,
                reservation,
                report,
                order: Arc::clone(&order),
                worst_case_increase,
                shadow: state,
                cancel_rx: (batch.shape == BatchShape::FourStage && kind == OperationKind::Primary)
                    .then(|| cancel_rx.clone()),
                cancel_tx: (kind == OperationKind::Secondary).then(|| Arc::clone(&cancel_tx)),
                shutdown: shutdown.clone(),
            };
            tasks.push((kind, tokio::spawn(task.run())));
        }

        Ok(BatchHandle {
            batch_id,
            shape: batch.shape,
            anchor: timeline.anchor,
            timeline,
            canonical_order,
            order,
            tasks,
        })
    }

    /// Start `batch` and wait for every stage to resolve.
    pub async fn run(
        &self,
        batch_id: u64,
        batch: &Batch,
        previous_anchor: Instant,
        shadow: &TargetState,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<BatchReport> {
        let handle = self.start(batch_id, batch, previous_anchor, shadow, shutdown).await?;
        Ok(handle.finish().await)
    }

    async fn release(&self, batch_id: u64, reservation: &Reservation) {
        if let Err(e) = self.client.release(reservation).await {
            warn!(batch_id, error = %e, "failed to release reservation");
        }
    }
}

/// A started batch.
#[derive(Debug)]
pub struct BatchHandle {
    pub batch_id: u64,
    pub shape: BatchShape,
    /// Anchor for the next batch.
    pub anchor: Instant,
    pub timeline: Timeline,
    canonical_order: String,
    order: Arc<Mutex<String>>,
    tasks: Vec<(OperationKind, JoinHandle<StageReport>)>,
}

impl BatchHandle {
    /// Wait for every stage and classify the batch.
    pub async fn finish(self) -> BatchReport {
        let mut stages = Vec::with_capacity(self.tasks.len());
        let mut lost = false;
        for (kind, task) in self.tasks {
            match task.await {
                Ok(report) => stages.push(report),
                Err(e) => {
                    error!(batch_id = self.batch_id, stage = kind.label(), error = %e, "stage task failed");
                    lost = true;
                }
            }
        }

        let observed_order = self.order.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let aborted = lost || stages.iter().any(|s| s.state == StageState::Aborted);
        let classification = if aborted {
            Classification::Partial
        } else if observed_order == self.canonical_order {
            Classification::Success
        } else {
            Classification::OutOfOrder
        };

        let report = BatchReport {
            batch_id: self.batch_id,
            shape: self.shape,
            observed_order,
            canonical_order: self.canonical_order,
            classification,
            stages,
        };
        match classification {
            Classification::Success => info!(
                batch_id = report.batch_id,
                shape = %report.shape,
                order = %report.observed_order,
                "batch finished"
            ),
            Classification::Partial => warn!(
                batch_id = report.batch_id,
                shape = %report.shape,
                order = %report.observed_order,
                aborted = ?report.aborted_stages(),
                "batch finished partially"
            ),
            Classification::OutOfOrder => warn!(
                batch_id = report.batch_id,
                shape = %report.shape,
                order = %report.observed_order,
                expected = %report.canonical_order,
                "batch finished out of order"
            ),
        }
        report
    }
}

struct StageTask {
    runner: BatchRunner,
    batch_id: u64,
    ordinal: usize,
    timing: StageTiming,
    reservation: Reservation,
    report: StageReport,
    order: Arc<Mutex<String>>,
    /// Volatility that may be added before the stage launches.
    worst_case_increase: f64,
    shadow: TargetState,
    cancel_rx: Option<watch::Receiver<bool>>,
    cancel_tx: Option<Arc<watch::Sender<bool>>>,
    shutdown: watch::Receiver<bool>,
}

impl StageTask {
    async fn run(mut self) -> StageReport {
        let kind = self.report.kind;
        let waited = match self.timing {
            StageTiming::Immediate { end } => self.wait_immediate(end).await,
            StageTiming::Deferred { window } => self.wait_deferred(window).await,
        };
        if let Err(reason) = waited {
            return self.abort(reason).await;
        }

        let args = vec![format!("batch={}", self.batch_id), format!("stage={}", kind.label())];
        let pids = match launch_pinned(
            self.runner.processes.as_ref(),
            &self.reservation,
            kind.worker(),
            &self.runner.settings.target,
            &args,
        ) {
            Ok(pids) => pids,
            Err(e) => {
                warn!(batch_id = self.batch_id, stage = kind.label(), error = %e, "stage launch failed");
                return self.abort(AbortReason::LaunchFailed).await;
            }
        };
        self.report.advance(StageState::Launched);
        self.report.pids = pids;
        self.report.advance(StageState::Running);
        debug!(
            batch_id = self.batch_id,
            stage = kind.label(),
            units = self.report.units,
            workers = self.report.pids.len(),
            "stage launched"
        );

        if !self.wait_for_workers().await {
            for pid in &self.report.pids {
                self.runner.processes.kill(*pid);
            }
            return self.abort(AbortReason::Shutdown).await;
        }

        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(&self.ordinal.to_string());
        self.runner.release(self.batch_id, &self.reservation).await;
        self.report.advance(StageState::Completed);
        self.report
    }

    async fn abort(mut self, reason: AbortReason) -> StageReport {
        self.runner.release(self.batch_id, &self.reservation).await;
        if let Some(tx) = &self.cancel_tx {
            tx.send_replace(true);
        }
        self.report.abort(reason);
        match reason {
            AbortReason::Late => warn!(batch_id = self.batch_id, stage = self.report.kind.label(), "stage late, aborted"),
            _ => debug!(batch_id = self.batch_id, stage = self.report.kind.label(), %reason, "stage aborted"),
        }
        self.report
    }

    fn state(&self) -> TargetState {
        self.runner.observe(&self.shadow)
    }

    fn fresh_duration(&self, state: &TargetState) -> Duration {
        self.runner.formulas.duration(self.report.kind.worker(), state)
    }

    /// Sleep until `until` unless shutdown or cancellation comes first.
    async fn nap(&mut self, until: Instant) -> Result<(), AbortReason> {
        tokio::select! {
            _ = sleep_until(until) => Ok(()),
            _ = raised(&mut self.shutdown) => Err(AbortReason::Shutdown),
            _ = maybe_raised(self.cancel_rx.as_mut()) => Err(AbortReason::Cancelled),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep so the stage completes at `end`, re-reading the duration
    /// after each sleep. Launches late rather than never.
    async fn wait_immediate(&mut self, end: Instant) -> Result<(), AbortReason> {
        loop {
            let state = self.state();
            let duration = self.fresh_duration(&state);
            let now = Instant::now();
            let launch_at = end.checked_sub(duration).unwrap_or(now);
            if launch_at <= now + self.runner.settings.min_backoff {
                return Ok(());
            }
            self.nap(launch_at).await?;
        }
    }

    /// Back off until the stage could complete inside `window`, then take
    /// a fresh duration reading and either launch or give up as late.
    /// Every sleep is followed by another reading.
    async fn wait_deferred(&mut self, window: Window) -> Result<(), AbortReason> {
        let settings = Arc::clone(&self.runner.settings);
        loop {
            if self.cancelled() {
                return Err(AbortReason::Cancelled);
            }
            let state = self.state();
            let now = Instant::now();

            let worst = self.fresh_duration(&state.with_difficulty(state.difficulty + self.worst_case_increase));
            if now + worst < window.earliest_end {
                let gap = window.earliest_end - (now + worst);
                let step = gap.mul_f64(settings.backoff_fraction).max(settings.min_backoff).min(gap);
                self.nap(now + step).await?;
                continue;
            }

            let duration = self.fresh_duration(&state);
            if now + duration > window.latest_end {
                return Err(AbortReason::Late);
            }
            if let Some(start) = window.earliest_end.checked_sub(duration)
                && start > now
            {
                self.nap(start).await?;
                continue;
            }
            return Ok(());
        }
    }

    /// Poll until every worker has exited. Returns `false` on shutdown.
    async fn wait_for_workers(&mut self) -> bool {
        let poll = self.runner.settings.poll_interval;
        loop {
            let processes = &self.runner.processes;
            if self.report.pids.iter().all(|pid| !processes.is_alive(*pid)) {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = raised(&mut self.shutdown) => return false,
            }
        }
    }
}

/// Resolves once the flag is set. A dropped sender never resolves.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn maybe_raised(rx: Option<&mut watch::Receiver<bool>>) {
    match rx {
        Some(rx) => raised(rx).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use slot_core::WorkerKind;
    use slotgrid_alloc::protocol::Envelope;
    use slotgrid_alloc::{AllocatorService, AllocatorSettings, ClientSettings, Operation};
    use slotgrid_sim::SimCluster;
    use tokio::sync::mpsc;

    use super::*;

    /// Every worker kind takes `base`, scaled by difficulty, unless its
    /// duration is pinned.
    struct StubFormulas {
        base: Duration,
        pinned: Mutex<Option<(WorkerKind, Duration)>>,
    }

    impl StubFormulas {
        fn pin(&self, kind: WorkerKind, duration: Duration) {
            *self.pinned.lock().unwrap() = Some((kind, duration));
        }
    }

    impl Formulas for StubFormulas {
        fn duration(&self, kind: WorkerKind, state: &TargetState) -> Duration {
            match *self.pinned.lock().unwrap() {
                Some((pinned, d)) if pinned == kind => d,
                _ => self.base.mul_f64(state.difficulty.max(1.0)),
            }
        }

        fn extraction_fraction_per_unit(&self, _state: &TargetState) -> f64 {
            0.01
        }

        fn secondary_units_to_restore(&self, state: &TargetState) -> u32 {
            slot_core::ceil_units((state.ceiling - state.yield_amount) / 10.0)
        }

        fn yield_after_secondary(&self, state: &TargetState, units: u32) -> f64 {
            (state.yield_amount + 10.0 * f64::from(units)).min(state.ceiling)
        }
    }

    fn prepared() -> TargetState {
        TargetState {
            difficulty: 1.0,
            floor: 1.0,
            yield_amount: 1000.0,
            ceiling: 1000.0,
        }
    }

    struct Harness {
        sim: Arc<SimCluster>,
        formulas: Arc<StubFormulas>,
        runner: BatchRunner,
        _shutdown: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn harness(base: Duration) -> Harness {
        let formulas = Arc::new(StubFormulas {
            base,
            pinned: Mutex::new(None),
        });
        let sim = Arc::new(SimCluster::with_formulas(formulas.clone(), 1.0));
        sim.add_host("A", 1000.0);
        sim.set_target("t", prepared());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = AllocatorService::new(allocator_settings(), sim.clone(), sim.clone());
        let (handle, _join) = service.spawn(shutdown_rx.clone());
        let client = Arc::new(handle.client(sim.register_owner(), ClientSettings::default()));

        let runner = BatchRunner::new(
            client,
            sim.clone(),
            sim.clone(),
            formulas.clone(),
            RunnerSettings {
                target: "t".into(),
                host_filter: HostFilter::Any,
                ..RunnerSettings::default()
            },
        );
        Harness {
            sim,
            formulas,
            runner,
            _shutdown: shutdown_tx,
            shutdown_rx,
        }
    }

    fn allocator_settings() -> AllocatorSettings {
        AllocatorSettings {
            block_size: 1.0,
            housekeeping_period: Duration::from_secs(5),
            privileged_host: None,
            reserved: HashMap::new(),
            response_cache: 64,
        }
    }

    async fn all_released(h: &Harness) {
        let status = h.runner.client().status().await.unwrap();
        assert_eq!(status.available, status.total);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_durations_complete_in_canonical_order() {
        for base in [Duration::from_millis(200), Duration::from_secs(3)] {
            let h = harness(base);
            let batch = Batch::four_stage(10, 1, 10, 1);
            let report = h
                .runner
                .run(1, &batch, Instant::now(), &prepared(), h.shutdown_rx.clone())
                .await
                .unwrap();

            assert_eq!(report.classification, Classification::Success, "{base:?}");
            assert_eq!(report.observed_order, "1234");
            assert_eq!(report.canonical_order, "1234");
            assert!(report.stages.iter().all(|s| s.state == StageState::Completed));
            all_released(&h).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_batch_runs_its_corrective() {
        let h = harness(Duration::from_millis(100));
        h.sim.set_target(
            "t",
            TargetState {
                difficulty: 3.0,
                ..prepared()
            },
        );
        let report = h
            .runner
            .run(1, &Batch::single(40), Instant::now(), &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        assert_eq!(report.classification, Classification::Success);
        assert_eq!(report.observed_order, "1");
        let completions = h.sim.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].worker, WorkerKind::Correct);
    }

    #[tokio::test(start_paused = true)]
    async fn late_secondary_makes_paired_batch_partial() {
        let h = harness(Duration::from_secs(1));
        let state = TargetState {
            yield_amount: 500.0,
            ..prepared()
        };
        h.sim.set_target("t", state);

        let handle = h
            .runner
            .start(7, &Batch::paired(50, 4), Instant::now(), &state, h.shutdown_rx.clone())
            .await
            .unwrap();
        // Stage tasks have not run yet. Hardening the target now makes the
        // secondary's fresh duration overshoot its window.
        h.sim.set_target(
            "t",
            TargetState {
                difficulty: 5.0,
                ..state
            },
        );
        let report = handle.finish().await;

        assert_eq!(report.classification, Classification::Partial);
        assert_eq!(report.aborted_stages(), vec![(OperationKind::Secondary, AbortReason::Late)]);
        assert_eq!(report.observed_order, "2");
        assert_eq!(
            report.stage(OperationKind::CorrectiveB).map(|s| s.state),
            Some(StageState::Completed)
        );
        all_released(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn secondary_abort_cancels_waiting_primary() {
        let h = harness(Duration::from_millis(100));
        // Anchored two seconds out, so the primary backs off for a while.
        let anchor = Instant::now() + Duration::from_secs(2);
        let handle = h
            .runner
            .start(3, &Batch::four_stage(10, 1, 10, 1), anchor, &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        h.formulas.pin(WorkerKind::Replenish, Duration::from_secs(10));
        let report = handle.finish().await;

        assert_eq!(report.classification, Classification::Partial);
        assert_eq!(
            report.aborted_stages(),
            vec![
                (OperationKind::Primary, AbortReason::Cancelled),
                (OperationKind::Secondary, AbortReason::Late),
            ]
        );
        assert_eq!(report.observed_order, "24");
        assert!(h.sim.completions().iter().all(|c| c.worker == WorkerKind::Correct));
        all_released(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_primary_leaves_secondary_running() {
        let h = harness(Duration::from_millis(100));
        let anchor = Instant::now() + Duration::from_secs(2);
        let handle = h
            .runner
            .start(4, &Batch::four_stage(10, 1, 10, 1), anchor, &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        h.formulas.pin(WorkerKind::Extract, Duration::from_secs(10));
        let report = handle.finish().await;

        assert_eq!(report.aborted_stages(), vec![(OperationKind::Primary, AbortReason::Late)]);
        assert_eq!(
            report.stage(OperationKind::Secondary).map(|s| s.state),
            Some(StageState::Completed)
        );
        assert_eq!(report.observed_order, "234");
        assert_eq!(report.classification, Classification::Partial);
        all_released(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_reservation_releases_earlier_stages() {
        let h = harness(Duration::from_millis(100));
        // 1000 blocks: primary and corrective-a fit, secondary does not
        let err = h
            .runner
            .start(1, &Batch::four_stage(600, 24, 600, 48), Instant::now(), &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap_err();
        assert!(err.is_out_of_memory());
        all_released(&h).await;
        assert_eq!(h.sim.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_kills_running_workers() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let h = harness(Duration::from_secs(2));
        let handle = h
            .runner
            .start(1, &Batch::single(10), Instant::now(), &prepared(), stop_rx)
            .await
            .unwrap();

        // the corrective launches at once and runs for 2s
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.sim.running(), 1);
        stop_tx.send(true).unwrap();

        let report = handle.finish().await;
        assert_eq!(report.classification, Classification::Partial);
        assert_eq!(report.aborted_stages(), vec![(OperationKind::CorrectiveA, AbortReason::Shutdown)]);
        assert_eq!(h.sim.running(), 0);
        all_released(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn primary_rereads_duration_after_final_sleep() {
        let h = harness(Duration::from_secs(1));
        let t0 = Instant::now();
        // The primary's window opens at t0+2.025s, so with a 1s duration it
        // sleeps until t0+1.025s before launching.
        let handle = h
            .runner
            .start(5, &Batch::four_stage(10, 1, 10, 1), t0 + Duration::from_secs(2), &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        tokio::time::sleep_until(t0 + Duration::from_secs(1)).await;
        h.formulas.pin(WorkerKind::Extract, Duration::from_secs(2));
        let report = handle.finish().await;

        assert_eq!(report.aborted_stages(), vec![(OperationKind::Primary, AbortReason::Late)]);
        assert_eq!(report.observed_order, "234");
        assert_eq!(report.classification, Classification::Partial);
        assert!(h.sim.completions().iter().all(|c| c.worker != WorkerKind::Extract));
        all_released(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_correctives_finish_out_of_order() {
        let h = harness(Duration::from_millis(100));
        let t0 = Instant::now();
        let handle = h
            .runner
            .start(6, &Batch::four_stage(10, 1, 10, 1), t0, &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        // Both correctives are still waiting to launch (at 0.65s and 1.4s).
        // Immediate stages launch anyway and now finish after the deferred ones.
        tokio::time::sleep_until(t0 + Duration::from_millis(600)).await;
        h.formulas.pin(WorkerKind::Correct, Duration::from_secs(2));
        let report = handle.finish().await;

        assert_eq!(report.classification, Classification::OutOfOrder);
        assert!(report.aborted_stages().is_empty());
        assert!(report.stages.iter().all(|s| s.state == StageState::Completed));
        assert_eq!(report.observed_order, "1324");
        assert_eq!(report.canonical_order, "1234");
        all_released(&h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_release_does_not_reorder_completions() {
        let h = harness(Duration::from_millis(100));
        let (service_tx, service_rx) = mpsc::channel(64);
        let service = AllocatorService::new(allocator_settings(), h.sim.clone(), h.sim.clone());
        tokio::spawn(service.run(service_rx, h.shutdown_rx.clone()));

        // Forward requests, holding back the first release for 2s.
        let (client_tx, mut client_rx) = mpsc::channel::<Envelope>(64);
        tokio::spawn(async move {
            let mut held = false;
            while let Some(envelope) = client_rx.recv().await {
                let hold = matches!(envelope.request.operation, Operation::Free { .. }) && !held;
                held |= hold;
                let tx = service_tx.clone();
                tokio::spawn(async move {
                    if hold {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    let _ = tx.send(envelope).await;
                });
            }
        });
        let settings = ClientSettings {
            timeout: Duration::from_secs(10),
            retries: 0,
        };
        let client = Arc::new(AllocatorClient::new(h.sim.register_owner(), client_tx, settings));
        let runner = BatchRunner::new(
            client,
            h.sim.clone(),
            h.sim.clone(),
            h.formulas.clone(),
            RunnerSettings {
                target: "t".into(),
                host_filter: HostFilter::Any,
                ..RunnerSettings::default()
            },
        );

        let report = runner
            .run(1, &Batch::four_stage(10, 1, 10, 1), Instant::now(), &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        // the primary finishes first; its release completes last
        assert_eq!(report.observed_order, "1234");
        assert_eq!(report.classification, Classification::Success);
        let status = runner.client().status().await.unwrap();
        assert_eq!(status.available, status.total);
    }

    #[tokio::test(start_paused = true)]
    async fn worst_case_increase_covers_earlier_batches() {
        let h = harness(Duration::from_millis(100));
        let effects = h.formulas.effects();
        let large = effects.increase(OperationKind::Primary, 100) + effects.increase(OperationKind::Secondary, 100);

        let first = h
            .runner
            .start(1, &Batch::four_stage(100, 4, 100, 8), Instant::now(), &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        let second = h
            .runner
            .start(2, &Batch::four_stage(10, 1, 10, 1), first.anchor, &prepared(), h.shutdown_rx.clone())
            .await
            .unwrap();
        assert_eq!(h.runner.worst_case_increase(), large);
        assert_eq!(h.runner.clone().worst_case_increase(), large);

        first.finish().await;
        second.finish().await;
        all_released(&h).await;
    }
}
