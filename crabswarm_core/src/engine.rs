//! Engine - runs a validated configuration to completion
//!
//! The control loop ticks the scheduler on `tick_interval`, evaluates
//! thresholds live on `threshold_interval` and reacts to the three ways a run
//! can be cut short: an external abort, the run deadline, and a failing
//! `abortOnFail` threshold. Once every scenario has completed, the telemetry
//! channel is closed and drained, and thresholds get their final,
//! authoritative evaluation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, TokioClock};
use crate::config::duration::serialize_secs;
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::{ConfigError, EngineError};
use crate::http::HttpClient;
use crate::metrics::{CollectorStats, MetricRegistry, MetricsCollector, SinkSnapshot, Snapshots};
use crate::scheduler::{ScenarioState, ScenarioSummary, Scheduler};
use crate::thresholds::{Outcome, ThresholdEvaluator, ThresholdReport};
use crate::vu::IterationRegistry;

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
pub const EXIT_DEADLINE: i32 = 102;
pub const EXIT_INVALID_CONFIG: i32 = 104;
pub const EXIT_ABORTED: i32 = 105;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// External cancellation, e.g. Ctrl-C
    Signal,
    Deadline,
    Threshold { rule: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    ThresholdsFailed,
    Aborted(AbortReason),
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Passed => EXIT_PASSED,
            RunStatus::ThresholdsFailed => EXIT_THRESHOLDS_FAILED,
            RunStatus::Aborted(AbortReason::Threshold { .. }) => EXIT_THRESHOLDS_FAILED,
            RunStatus::Aborted(AbortReason::Deadline) => EXIT_DEADLINE,
            RunStatus::Aborted(AbortReason::Signal) => EXIT_ABORTED,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub status: RunStatus,
    pub metrics: Snapshots,
    pub thresholds: Vec<ThresholdReport>,
    pub scenarios: Vec<ScenarioSummary>,
    pub collector: CollectorStats,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn metric(&self, key: &str) -> Option<&SinkSnapshot> {
        self.metrics.get(key)
    }
}

/// Live view of a run, published once per tick.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub elapsed: Duration,
    pub active_vus: u64,
    pub live_vus: u64,
    pub scenarios: Vec<(String, ScenarioState)>,
    /// Outcomes of the latest live threshold evaluation
    pub thresholds: BTreeMap<String, Outcome>,
}

pub struct Engine {
    config: RunConfig,
    iterations: IterationRegistry,
    http: Arc<dyn HttpClient>,
    clock: Option<SharedClock>,
    registry: Arc<MetricRegistry>,
    progress: watch::Sender<Progress>,
}

impl Engine {
    pub fn new(
        config: RunConfig,
        iterations: IterationRegistry,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        for scenario in &config.scenarios {
            if !iterations.contains(&scenario.exec) {
                return Err(ConfigError::UnknownExec {
                    scenario: scenario.name.clone(),
                    exec: scenario.exec.clone(),
                }
                .into());
            }
        }

        let registry = Arc::new(MetricRegistry::new(config.trend_storage));
        for rule in config.thresholds.iter().filter(|r| r.metric.is_submetric()) {
            match rule.expected_kind() {
                Some(kind) => {
                    registry.register_submetric(&rule.metric, kind);
                }
                None => registry.declare_submetric(&rule.metric),
            }
        }

        let (progress, _) = watch::channel(Progress::default());
        Ok(Self {
            config,
            iterations,
            http,
            clock: None,
            registry,
            progress,
        })
    }

    /// Use `clock` instead of a [`TokioClock`] started with the run.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The run's metrics, for live reporting
    pub fn registry(&self) -> Arc<MetricRegistry> {
        self.registry.clone()
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub async fn run(self) -> Result<RunResult, EngineError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until every scenario completes. When `abort` resolves first, all
    /// scenarios drain within their graceful stop and the run reports
    /// [`AbortReason::Signal`].
    pub async fn run_until<F>(self, abort: F) -> Result<RunResult, EngineError>
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let clock = self
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(TokioClock::new()));
        let (sender, collector) = MetricsCollector::spawn(self.registry.clone());
        let ctx = RunContext::new(
            clock.clone(),
            self.http.clone(),
            sender,
            self.config.tags.clone(),
        );
        let run_id = ctx.run_id;
        let mut scheduler = Scheduler::new(&self.config, &self.iterations, ctx)?;
        let evaluator =
            ThresholdEvaluator::new(self.config.thresholds.clone(), self.config.inconclusive);

        info!(
            "Starting run {} with {} scenarios ({} thresholds)",
            run_id,
            self.config.scenarios.len(),
            evaluator.rules().len()
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(abort);

        let mut abort_reason: Option<AbortReason> = None;
        let mut last_evaluation = Duration::ZERO;
        let mut outcomes = BTreeMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut abort, if abort_reason.is_none() => {
                    warn!("Abort requested, draining VUs");
                    abort_reason = Some(AbortReason::Signal);
                    scheduler.abort(clock.elapsed());
                }
            }

            let now = clock.elapsed();
            if let Some(deadline) = self.config.deadline {
                if abort_reason.is_none() && now >= deadline {
                    warn!("Run deadline of {:?} reached, draining VUs", deadline);
                    abort_reason = Some(AbortReason::Deadline);
                    scheduler.abort(now);
                }
            }

            scheduler.tick(now);

            if !evaluator.rules().is_empty()
                && now.saturating_sub(last_evaluation) >= self.config.threshold_interval
            {
                last_evaluation = now;
                outcomes = evaluator.evaluate(&self.registry.snapshot(now));
                if abort_reason.is_none() {
                    if let Some(rule) = evaluator.abort_trigger(&outcomes, now) {
                        warn!("Threshold '{}' failed, aborting run", rule.key());
                        abort_reason = Some(AbortReason::Threshold { rule: rule.key() });
                        scheduler.abort(now);
                    }
                }
            }

            self.progress.send_replace(Progress {
                elapsed: now,
                active_vus: scheduler.active_vus(),
                live_vus: scheduler.live_vus(),
                scenarios: scheduler
                    .scenarios()
                    .iter()
                    .map(|s| (s.name().to_string(), s.state()))
                    .collect(),
                thresholds: outcomes.clone(),
            });

            if scheduler.is_complete() {
                break;
            }
        }

        let elapsed = clock.elapsed();
        let scenarios = scheduler.summaries();
        scheduler.shutdown().await;
        let collector = collector
            .await
            .map_err(|e| EngineError::Collector(e.to_string()))?;

        let metrics = self.registry.snapshot(elapsed);
        let final_outcomes = evaluator.evaluate(&metrics);
        let thresholds = evaluator.report(&metrics);
        let status = match abort_reason {
            Some(reason) => RunStatus::Aborted(reason),
            None if evaluator.passed(&final_outcomes) => RunStatus::Passed,
            None => RunStatus::ThresholdsFailed,
        };

        info!(
            "Run {} finished after {:?}: {:?} ({} samples ingested)",
            run_id, elapsed, status, collector.ingested
        );

        Ok(RunResult {
            run_id,
            started_at,
            elapsed,
            status,
            metrics,
            thresholds,
            scenarios,
            collector,
        })
    }
}
