//! Scheduler - VU lifecycle across all scenarios
//!
//! Each scenario gets a [`ScenarioRun`] that walks
//! `Pending -> Active -> Draining -> Completed` and, on every tick, reconciles
//! its live VUs with what its executor asks for. The scheduler only does
//! bookkeeping: it never awaits a VU, it reads finished join handles and
//! aborts VUs that overstay their grace period.
//!
//! Ramp-downs evict the oldest-started VUs first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::{RunConfig, ScenarioSpec};
use crate::context::RunContext;
use crate::error::ConfigError;
use crate::executor::{Executor, ExecutorKind};
use crate::metrics::{builtin, MetricKind, MetricSample, Tags};
use crate::vu::{
    Iteration, IterationRegistry, VuContext, VuId, VuPhase, VuReport, VuRunner, VuShared,
    VuState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioState {
    /// Waiting for its start offset
    Pending,
    Active,
    /// Timeline over or run aborted; live VUs are finishing
    Draining,
    Completed,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioState::Pending => "pending",
            ScenarioState::Active => "active",
            ScenarioState::Draining => "draining",
            ScenarioState::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Per-scenario totals reported with the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub executor: ExecutorKind,
    pub state: ScenarioState,
    pub vus_started: u64,
    pub peak_vus: u64,
    pub iterations: u64,
    pub faults: u64,
    pub interrupted: u64,
}

struct VuSlot {
    state: VuState,
    started_at: Duration,
    shared: Arc<VuShared>,
    /// Force-stop time once draining
    deadline: Option<Duration>,
    handle: JoinHandle<VuReport>,
}

impl VuSlot {
    fn drain(&mut self, deadline: Duration) {
        self.state.phase = VuPhase::Draining;
        self.shared.drain();
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
    }
}

pub struct ScenarioRun {
    spec: ScenarioSpec,
    executor: Box<dyn Executor>,
    iteration: Arc<dyn Iteration>,
    tags: Arc<Tags>,
    state: ScenarioState,
    /// Live VUs, oldest first
    vus: VecDeque<VuSlot>,
    next_ordinal: u64,
    summary: ScenarioSummary,
}

impl ScenarioRun {
    pub fn new(spec: ScenarioSpec, iteration: Arc<dyn Iteration>, run_tags: &Tags) -> Self {
        let executor = spec.executor.build();
        let mut tags = run_tags.clone();
        tags.extend(spec.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags.insert("scenario".to_string(), spec.name.clone());

        let summary = ScenarioSummary {
            name: spec.name.clone(),
            executor: executor.kind(),
            state: ScenarioState::Pending,
            vus_started: 0,
            peak_vus: 0,
            iterations: 0,
            faults: 0,
            interrupted: 0,
        };
        Self {
            spec,
            executor,
            iteration,
            tags: Arc::new(tags),
            state: ScenarioState::Pending,
            vus: VecDeque::new(),
            next_ordinal: 1,
            summary,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    /// VUs still alive, draining ones included
    pub fn live_vus(&self) -> u64 {
        self.vus.len() as u64
    }

    /// VUs that will start another iteration
    pub fn active_vus(&self) -> u64 {
        self.vus
            .iter()
            .filter(|slot| slot.state.phase == VuPhase::Running)
            .count() as u64
    }

    pub fn vu_states(&self) -> impl Iterator<Item = &VuState> {
        self.vus.iter().map(|slot| &slot.state)
    }

    pub fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            state: self.state,
            ..self.summary.clone()
        }
    }

    fn timeline_end(&self) -> Duration {
        self.spec.start_time.saturating_add(self.executor.timeline())
    }

    /// One reconciliation step. `available` is what is left of the run-wide
    /// VU budget and is decremented by every spawn. Returns the handles of
    /// VUs aborted on this tick.
    fn tick(
        &mut self,
        now: Duration,
        ctx: &RunContext,
        available: &mut Option<u64>,
    ) -> Vec<JoinHandle<VuReport>> {
        self.reap();
        let stopped = self.force_stop_overdue(now, ctx);

        if self.state == ScenarioState::Pending && now >= self.spec.start_time {
            tracing::info!(
                "Scenario '{}' started ({}, peak {} VUs)",
                self.spec.name,
                self.executor.kind(),
                self.executor.peak_vus()
            );
            self.state = ScenarioState::Active;
        }

        if self.state == ScenarioState::Active {
            if now >= self.timeline_end() {
                let deadline = self.timeline_end().saturating_add(self.spec.graceful_stop);
                tracing::info!(
                    "Scenario '{}' timeline finished, draining {} VUs",
                    self.spec.name,
                    self.vus.len()
                );
                self.drain_all(deadline);
            } else {
                let desired = self.executor.desired_concurrency(now - self.spec.start_time);
                self.reconcile(desired, now, ctx, available);
            }
        }

        if self.state == ScenarioState::Draining && self.vus.is_empty() {
            tracing::info!(
                "Scenario '{}' completed: {} iterations, {} faults, {} interrupted",
                self.spec.name,
                self.summary.iterations,
                self.summary.faults,
                self.summary.interrupted
            );
            self.state = ScenarioState::Completed;
        }
        stopped
    }

    fn reconcile(
        &mut self,
        desired: u64,
        now: Duration,
        ctx: &RunContext,
        available: &mut Option<u64>,
    ) {
        let running = self.active_vus();
        if desired > running {
            let mut wanted = desired - running;
            if let Some(max_vus) = self.spec.max_vus {
                wanted = wanted.min(max_vus.saturating_sub(self.live_vus()));
            }
            if let Some(left) = available {
                wanted = wanted.min(*left);
                *left -= wanted;
            }
            if wanted < desired - running {
                tracing::debug!(
                    "Scenario '{}' wants {} VUs but only {} more fit its VU budget",
                    self.spec.name,
                    desired,
                    wanted
                );
            }
            for _ in 0..wanted {
                self.spawn_vu(now, ctx);
            }
        } else if desired < running {
            let deadline = now.saturating_add(self.executor.graceful_ramp_down());
            let mut excess = running - desired;
            for slot in self.vus.iter_mut() {
                if excess == 0 {
                    break;
                }
                if slot.state.phase == VuPhase::Running {
                    tracing::debug!("Ramping down VU {}", slot.state.id);
                    slot.drain(deadline);
                    excess -= 1;
                }
            }
        }
        self.summary.peak_vus = self.summary.peak_vus.max(self.active_vus());
    }

    fn spawn_vu(&mut self, now: Duration, ctx: &RunContext) {
        let id = VuId {
            scenario: Arc::from(self.spec.name.as_str()),
            ordinal: self.next_ordinal,
        };
        self.next_ordinal += 1;

        let shared = Arc::new(VuShared::default());
        let vu_ctx = VuContext::new(
            id.clone(),
            self.tags.clone(),
            ctx.clock.clone(),
            ctx.http.clone(),
        );
        let runner = VuRunner::new(
            vu_ctx,
            self.iteration.clone(),
            shared.clone(),
            ctx.samples.clone(),
        );

        let mut state = VuState::new(id);
        state.phase = VuPhase::Running;
        self.vus.push_back(VuSlot {
            state,
            started_at: now,
            shared,
            deadline: None,
            handle: tokio::spawn(runner.run()),
        });
        self.summary.vus_started += 1;
    }

    fn drain_all(&mut self, deadline: Duration) {
        for slot in self.vus.iter_mut() {
            slot.drain(deadline);
        }
        self.state = ScenarioState::Draining;
    }

    /// Collect VUs that stopped on their own.
    fn reap(&mut self) {
        let slots = std::mem::take(&mut self.vus);
        for mut slot in slots {
            if !slot.handle.is_finished() {
                self.vus.push_back(slot);
                continue;
            }
            match (&mut slot.handle).now_or_never() {
                Some(Ok(report)) => {
                    slot.state.iterations = report.iterations;
                    self.summary.iterations += report.iterations;
                    self.summary.faults += report.faults;
                }
                Some(Err(e)) => {
                    tracing::error!("VU {} task failed: {}", slot.state.id, e);
                }
                None => {
                    self.vus.push_back(slot);
                    continue;
                }
            }
            slot.state.phase = VuPhase::Stopped;
            tracing::debug!(
                "VU {} stopped after {} iterations",
                slot.state.id,
                slot.state.iterations
            );
        }
    }

    /// Abort draining VUs whose grace period ran out. Their in-flight
    /// iteration is lost and counted as interrupted; the ones they
    /// already finished still count.
    fn force_stop_overdue(&mut self, now: Duration, ctx: &RunContext) -> Vec<JoinHandle<VuReport>> {
        let mut stopped = Vec::new();
        let slots = std::mem::take(&mut self.vus);
        for slot in slots {
            match slot.deadline {
                Some(deadline) if now >= deadline => {
                    tracing::debug!(
                        "Force-stopping VU {} (started at {:?})",
                        slot.state.id,
                        slot.started_at
                    );
                    slot.handle.abort();
                    let done = slot.shared.progress();
                    self.summary.iterations += done.iterations;
                    self.summary.faults += done.faults;
                    self.summary.interrupted += 1;
                    stopped.push(slot.handle);
                }
                _ => self.vus.push_back(slot),
            }
        }
        if !stopped.is_empty() {
            tracing::warn!(
                "Scenario '{}': force-stopped {} VUs after their grace period",
                self.spec.name,
                stopped.len()
            );
            let batch = stopped
                .iter()
                .map(|_| {
                    MetricSample::new(
                        builtin::INTERRUPTED_ITERATIONS,
                        MetricKind::Counter,
                        1.0,
                        now,
                    )
                    .with_tags((*self.tags).clone())
                })
                .collect();
            ctx.samples.send(batch);
        }
        stopped
    }

    fn abort(&mut self, now: Duration) {
        match self.state {
            ScenarioState::Pending => {
                tracing::info!("Scenario '{}' skipped, run aborted", self.spec.name);
                self.state = ScenarioState::Completed;
            }
            ScenarioState::Active | ScenarioState::Draining => {
                self.drain_all(now.saturating_add(self.spec.graceful_stop));
            }
            ScenarioState::Completed => {}
        }
    }
}

/// Drives every scenario of a run.
pub struct Scheduler {
    scenarios: Vec<ScenarioRun>,
    ctx: RunContext,
    max_vus: Option<u64>,
    /// Aborted VU tasks, awaited on shutdown so their resources are released
    stopped: Vec<JoinHandle<VuReport>>,
}

impl Scheduler {
    pub fn new(
        config: &RunConfig,
        iterations: &IterationRegistry,
        ctx: RunContext,
    ) -> Result<Self, ConfigError> {
        let scenarios = config
            .scenarios
            .iter()
            .map(|spec| {
                let iteration =
                    iterations
                        .get(&spec.exec)
                        .ok_or_else(|| ConfigError::UnknownExec {
                            scenario: spec.name.clone(),
                            exec: spec.exec.clone(),
                        })?;
                Ok(ScenarioRun::new(spec.clone(), iteration, &ctx.tags))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            scenarios,
            ctx,
            max_vus: config.max_vus,
            stopped: Vec::new(),
        })
    }

    pub fn tick(&mut self, now: Duration) {
        let mut available = self
            .max_vus
            .map(|max| max.saturating_sub(self.live_vus()));
        for scenario in &mut self.scenarios {
            let stopped = scenario.tick(now, &self.ctx, &mut available);
            self.stopped.extend(stopped);
        }
    }

    /// Move every scenario to draining. Each VU may finish its in-flight
    /// iteration within its scenario's graceful stop.
    pub fn abort(&mut self, now: Duration) {
        for scenario in &mut self.scenarios {
            scenario.abort(now);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.scenarios
            .iter()
            .all(|s| s.state() == ScenarioState::Completed)
    }

    pub fn live_vus(&self) -> u64 {
        self.scenarios.iter().map(ScenarioRun::live_vus).sum()
    }

    pub fn active_vus(&self) -> u64 {
        self.scenarios.iter().map(ScenarioRun::active_vus).sum()
    }

    pub fn scenarios(&self) -> &[ScenarioRun] {
        &self.scenarios
    }

    pub fn summaries(&self) -> Vec<ScenarioSummary> {
        self.scenarios.iter().map(ScenarioRun::summary).collect()
    }

    /// Wait for aborted VU tasks to be torn down. Consumes the scheduler so
    /// its telemetry sender is dropped with it.
    pub async fn shutdown(mut self) {
        for scenario in &mut self.scenarios {
            for slot in scenario.vus.drain(..) {
                slot.handle.abort();
                self.stopped.push(slot.handle);
            }
        }
        for handle in self.stopped.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!("VU task failed during shutdown: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TokioClock};
    use crate::error::{IterationError, TransportError};
    use crate::executor::{ExecutorSpec, Stage};
    use crate::http::{HttpClient, HttpResponse, Method};
    use crate::metrics::{MetricRegistry, MetricsCollector, SinkSnapshot};
    use async_trait::async_trait;

    struct NoHttp;

    #[async_trait]
    impl HttpClient for NoHttp {
        async fn request(&self, _: Method, url: &str) -> Result<HttpResponse, TransportError> {
            Err(TransportError::InvalidUrl(url.to_string()))
        }
    }

    /// Iteration that only waits.
    struct Pause(Duration);

    #[async_trait]
    impl Iteration for Pause {
        async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
            ctx.sleep(self.0).await;
            Ok(())
        }
    }

    /// Iteration that finishes quickly a few times, then hangs.
    struct HangsAfter(u64);

    #[async_trait]
    impl Iteration for HangsAfter {
        async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
            let pause = if ctx.iteration() > self.0 {
                Duration::from_secs(3600)
            } else {
                Duration::from_millis(100)
            };
            ctx.sleep(pause).await;
            Ok(())
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn registry_with(pause: Duration) -> IterationRegistry {
        let mut iterations = IterationRegistry::new();
        iterations.register("default", Pause(pause));
        iterations
    }

    struct Harness {
        clock: TokioClock,
        scheduler: Scheduler,
        registry: Arc<MetricRegistry>,
        collector: JoinHandle<crate::metrics::CollectorStats>,
    }

    impl Harness {
        fn new(config: &RunConfig, iterations: &IterationRegistry) -> Self {
            let clock = TokioClock::new();
            let registry = Arc::new(MetricRegistry::default());
            let (sender, collector) = MetricsCollector::spawn(registry.clone());
            let ctx = RunContext::new(Arc::new(clock), Arc::new(NoHttp), sender, Tags::new());
            Self {
                clock,
                scheduler: Scheduler::new(config, iterations, ctx).unwrap(),
                registry,
                collector,
            }
        }

        /// Tick every 100ms until `until` (run time) or completion.
        async fn run_until(&mut self, until: Duration) {
            while self.clock.elapsed() < until && !self.scheduler.is_complete() {
                self.scheduler.tick(self.clock.elapsed());
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        async fn finish(self) -> Arc<MetricRegistry> {
            self.scheduler.shutdown().await;
            self.collector.await.unwrap();
            self.registry
        }
    }

    fn navigation_config() -> RunConfig {
        let mut spec = ScenarioSpec::ramping(
            "navigation",
            1,
            vec![
                Stage::new(secs(5), 2),
                Stage::new(secs(10), 3),
                Stage::new(secs(5), 0),
            ],
        );
        if let ExecutorSpec::RampingVus {
            graceful_ramp_down, ..
        } = &mut spec.executor
        {
            *graceful_ramp_down = secs(5);
        }
        RunConfig::new(vec![spec])
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramping_scenario_tracks_curve() {
        let config = navigation_config();
        let mut harness = Harness::new(&config, &registry_with(Duration::from_millis(10)));

        harness.run_until(Duration::from_millis(2050)).await;
        assert_eq!(harness.scheduler.active_vus(), 1);

        harness.run_until(Duration::from_millis(7050)).await;
        assert_eq!(harness.scheduler.active_vus(), 2);

        harness.run_until(Duration::from_millis(15550)).await;
        assert_eq!(harness.scheduler.active_vus(), 3);

        harness.run_until(secs(60)).await;
        assert!(harness.scheduler.is_complete());
        assert_eq!(harness.scheduler.live_vus(), 0);

        let summary = harness.scheduler.summaries().remove(0);
        assert_eq!(summary.state, ScenarioState::Completed);
        assert_eq!(summary.peak_vus, 3);
        assert_eq!(summary.vus_started, 3);
        assert_eq!(summary.interrupted, 0);
        assert!(summary.iterations > 0);

        let registry = harness.finish().await;
        let snapshot = registry.snapshot_of("iterations", secs(20)).unwrap();
        match snapshot {
            SinkSnapshot::Counter(c) => assert_eq!(c.count as u64, summary.iterations),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_down_evicts_oldest_first() {
        let spec = ScenarioSpec {
            executor: ExecutorSpec::RampingVus {
                start_vus: 0,
                stages: vec![
                    Stage::new(Duration::ZERO, 3),
                    Stage::new(secs(5), 3),
                    Stage::new(Duration::ZERO, 1),
                    Stage::new(secs(5), 1),
                ],
                graceful_ramp_down: secs(1),
            },
            ..ScenarioSpec::ramping("steps", 0, Vec::new())
        };
        let config = RunConfig::new(vec![spec]);
        let mut harness = Harness::new(&config, &registry_with(Duration::from_millis(10)));

        harness.run_until(secs(7)).await;
        let active: Vec<u64> = harness.scheduler.scenarios()[0]
            .vu_states()
            .filter(|vu| vu.phase == VuPhase::Running)
            .map(|vu| vu.id.ordinal)
            .collect();
        assert_eq!(active, vec![3]);

        harness.run_until(secs(60)).await;
        assert!(harness.scheduler.is_complete());
        harness.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_vus_are_force_stopped() {
        let mut spec = ScenarioSpec::constant("stuck", 2, secs(1));
        spec.graceful_stop = secs(2);
        let config = RunConfig::new(vec![spec]);
        let mut harness = Harness::new(&config, &registry_with(secs(3600)));

        harness.run_until(secs(10)).await;
        assert!(harness.scheduler.is_complete());
        // timeline end + graceful stop + one tick
        assert!(harness.clock.elapsed() <= Duration::from_millis(3200));

        let summary = harness.scheduler.summaries().remove(0);
        assert_eq!(summary.interrupted, 2);
        assert_eq!(summary.iterations, 0);

        let registry = harness.finish().await;
        match registry.snapshot_of("interrupted_iterations", secs(3)) {
            Some(SinkSnapshot::Counter(c)) => assert_eq!(c.count, 2.0),
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.snapshot_of("iterations", secs(3)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_keeps_finished_iterations() {
        let mut spec = ScenarioSpec::constant("hangs", 1, secs(2));
        spec.graceful_stop = secs(1);
        let config = RunConfig::new(vec![spec]);
        let mut iterations = IterationRegistry::new();
        iterations.register("default", HangsAfter(3));
        let mut harness = Harness::new(&config, &iterations);

        harness.run_until(secs(10)).await;
        assert!(harness.scheduler.is_complete());

        let summary = harness.scheduler.summaries().remove(0);
        assert_eq!(summary.interrupted, 1);
        assert_eq!(summary.iterations, 3);

        let registry = harness.finish().await;
        match registry.snapshot_of("iterations", secs(3)) {
            Some(SinkSnapshot::Counter(c)) => assert_eq!(c.count as u64, summary.iterations),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_drains_active_and_skips_pending() {
        let active = ScenarioSpec::constant("active", 3, secs(60));
        let mut later = ScenarioSpec::constant("later", 1, secs(10));
        later.start_time = secs(30);
        let config = RunConfig::new(vec![active, later]);
        let mut harness = Harness::new(&config, &registry_with(Duration::from_millis(10)));

        harness.run_until(secs(1)).await;
        assert_eq!(harness.scheduler.active_vus(), 3);

        harness.scheduler.abort(harness.clock.elapsed());
        assert_eq!(harness.scheduler.active_vus(), 0);
        harness.run_until(secs(5)).await;
        assert!(harness.scheduler.is_complete());

        let summaries = harness.scheduler.summaries();
        assert_eq!(summaries[0].interrupted, 0);
        assert_eq!(summaries[1].vus_started, 0);
        assert_eq!(summaries[1].state, ScenarioState::Completed);
        harness.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_budget_caps_live_vus() {
        let config = RunConfig {
            max_vus: Some(4),
            ..RunConfig::new(vec![
                ScenarioSpec::constant("a", 3, secs(2)),
                ScenarioSpec::constant("b", 3, secs(2)),
            ])
        };
        let mut harness = Harness::new(&config, &registry_with(Duration::from_millis(10)));

        while !harness.scheduler.is_complete() {
            harness.scheduler.tick(harness.clock.elapsed());
            assert!(harness.scheduler.live_vus() <= 4);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let started: u64 = harness
            .scheduler
            .summaries()
            .iter()
            .map(|s| s.vus_started)
            .sum();
        assert_eq!(started, 4);
        harness.finish().await;
    }

    #[test]
    fn test_unknown_exec_is_rejected() {
        let mut spec = ScenarioSpec::constant("s", 1, secs(1));
        spec.exec = "missing".to_string();
        let config = RunConfig::new(vec![spec]);
        let (sender, _collector) = MetricsCollector::new(Arc::new(MetricRegistry::default()));
        let ctx = RunContext::new(
            Arc::new(TokioClock::new()),
            Arc::new(NoHttp),
            sender,
            Tags::new(),
        );
        let result = Scheduler::new(&config, &IterationRegistry::new(), ctx);
        assert!(matches!(result, Err(ConfigError::UnknownExec { .. })));
    }
}
