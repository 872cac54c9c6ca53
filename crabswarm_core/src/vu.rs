//! Virtual users - the iteration loop and the context iterations run against
//!
//! A VU is one tokio task that calls its iteration function over and over
//! until its scenario marks it draining. Samples produced during an iteration
//! are buffered in the [`VuContext`] and handed to the collector only when
//! the iteration ends, so a VU that is force-stopped mid-iteration loses that
//! iteration's partial telemetry instead of reporting half of it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::clock::SharedClock;
use crate::error::{IterationError, TransportError};
use crate::http::{HttpClient, HttpResponse, Method};
use crate::metrics::{builtin, MetricKind, MetricSample, SampleSender, Tags};

/// Name an iteration function is registered under when a scenario does not say.
pub const DEFAULT_EXEC: &str = "default";

/// The user-supplied work a VU repeats.
#[async_trait]
pub trait Iteration: Send + Sync {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError>;
}

/// Iteration functions by name; scenarios pick one with `exec`.
#[derive(Clone, Default)]
pub struct IterationRegistry {
    iterations: HashMap<String, Arc<dyn Iteration>>,
}

impl IterationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, iteration: impl Iteration + 'static) {
        self.iterations.insert(name.into(), Arc::new(iteration));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Iteration>> {
        self.iterations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iterations.contains_key(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VuId {
    pub scenario: Arc<str>,
    pub ordinal: u64,
}

impl fmt::Display for VuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scenario, self.ordinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuPhase {
    Idle,
    Running,
    /// Finishing its current iteration; starts no new ones
    Draining,
    Stopped,
}

/// Executor-side bookkeeping for one VU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VuState {
    pub id: VuId,
    pub phase: VuPhase,
    pub iterations: u64,
}

impl VuState {
    pub fn new(id: VuId) -> Self {
        Self {
            id,
            phase: VuPhase::Idle,
            iterations: 0,
        }
    }
}

/// Result of a single named assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum IterationOutcome {
    Completed,
    Faulted(IterationError),
}

/// What an iteration sees of the engine.
pub struct VuContext {
    id: VuId,
    iteration: u64,
    tags: Arc<Tags>,
    clock: SharedClock,
    http: Arc<dyn HttpClient>,
    buffer: Vec<MetricSample>,
}

impl VuContext {
    pub fn new(id: VuId, tags: Arc<Tags>, clock: SharedClock, http: Arc<dyn HttpClient>) -> Self {
        Self {
            id,
            iteration: 0,
            tags,
            clock,
            http,
            buffer: Vec::new(),
        }
    }

    pub fn id(&self) -> &VuId {
        &self.id
    }

    pub fn scenario(&self) -> &str {
        &self.id.scenario
    }

    /// 1-based number of the iteration currently running on this VU
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Time since run start
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Perform a request and record the `http_*` metrics for it.
    pub async fn request(
        &mut self,
        method: Method,
        url: &str,
    ) -> Result<HttpResponse, TransportError> {
        let started = self.elapsed();
        let result = self.http.request(method, url).await;

        let mut tags = vec![("method", method.as_str().to_string())];
        match &result {
            Ok(response) => {
                tags.push(("status", response.status.to_string()));
                let duration = if response.duration.is_zero() {
                    self.elapsed().saturating_sub(started)
                } else {
                    response.duration
                };
                self.record_tagged(
                    builtin::HTTP_REQ_DURATION,
                    MetricKind::Trend,
                    millis(duration),
                    &tags,
                );
                self.record_tagged(
                    builtin::HTTP_REQ_FAILED,
                    MetricKind::Rate,
                    flag(!response.is_success()),
                    &tags,
                );
                self.record_tagged(
                    builtin::DATA_RECEIVED,
                    MetricKind::Counter,
                    response.body.len() as f64,
                    &tags,
                );
            }
            Err(e) => {
                tracing::debug!("VU {} {} {} failed: {}", self.id, method, url, e);
                tags.push(("status", "0".to_string()));
                self.record_tagged(builtin::HTTP_REQ_FAILED, MetricKind::Rate, 1.0, &tags);
            }
        }
        self.record_tagged(builtin::HTTP_REQS, MetricKind::Counter, 1.0, &tags);
        result
    }

    pub async fn get(&mut self, url: &str) -> Result<HttpResponse, TransportError> {
        self.request(Method::Get, url).await
    }

    pub fn counter(&mut self, name: &str) -> MetricHandle<'_> {
        MetricHandle::new(self, name, MetricKind::Counter)
    }

    pub fn rate(&mut self, name: &str) -> MetricHandle<'_> {
        MetricHandle::new(self, name, MetricKind::Rate)
    }

    pub fn trend(&mut self, name: &str) -> MetricHandle<'_> {
        MetricHandle::new(self, name, MetricKind::Trend)
    }

    /// Start a group of named checks against `value`.
    ///
    /// ```ignore
    /// let ok = ctx
    ///     .check(&res)
    ///     .that("status 200", |r| r.status == 200)
    ///     .that("has body", |r| !r.body.is_empty())
    ///     .passed();
    /// ```
    pub fn check<'a, T: ?Sized>(&'a mut self, value: &'a T) -> Checks<'a, T> {
        Checks {
            ctx: self,
            value,
            passed: true,
        }
    }

    /// Record one check result: a `checks` sample tagged with the check name
    /// and a `check_failures` sample.
    pub fn record_check(&mut self, name: &str, ok: bool) -> CheckOutcome {
        let tags = [("check", name.to_string())];
        self.record_tagged(builtin::CHECKS, MetricKind::Rate, flag(ok), &tags);
        self.record_tagged(builtin::CHECK_FAILURES, MetricKind::Rate, flag(!ok), &tags);
        CheckOutcome {
            name: name.to_string(),
            ok,
            reason: (!ok).then(|| format!("check '{}' failed", name)),
        }
    }

    /// Think time. The engine never cuts this short except by force-stopping the VU.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn record_tagged(&mut self, metric: &str, kind: MetricKind, value: f64, extra: &[(&str, String)]) {
        let mut tags = (*self.tags).clone();
        for (key, value) in extra {
            tags.insert((*key).to_string(), value.clone());
        }
        self.buffer
            .push(MetricSample::new(metric, kind, value, self.elapsed()).with_tags(tags));
    }

    fn begin_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    fn take_samples(&mut self) -> Vec<MetricSample> {
        std::mem::take(&mut self.buffer)
    }
}

/// Handle returned by [`VuContext::counter`], [`VuContext::rate`] and [`VuContext::trend`].
pub struct MetricHandle<'a> {
    ctx: &'a mut VuContext,
    name: String,
    kind: MetricKind,
}

impl<'a> MetricHandle<'a> {
    fn new(ctx: &'a mut VuContext, name: &str, kind: MetricKind) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            kind,
        }
    }

    pub fn add(self, value: f64) {
        self.ctx.record_tagged(&self.name, self.kind, value, &[]);
    }

    /// Rate shorthand: `true` counts as a success.
    pub fn add_bool(self, value: bool) {
        self.add(flag(value));
    }
}

/// Builder returned by [`VuContext::check`]. Every `that` is recorded immediately.
pub struct Checks<'a, T: ?Sized> {
    ctx: &'a mut VuContext,
    value: &'a T,
    passed: bool,
}

impl<T: ?Sized> Checks<'_, T> {
    pub fn that(mut self, name: &str, predicate: impl FnOnce(&T) -> bool) -> Self {
        let ok = predicate(self.value);
        self.ctx.record_check(name, ok);
        self.passed &= ok;
        self
    }

    /// Conjunction of every predicate evaluated so far
    pub fn passed(self) -> bool {
        self.passed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VuReport {
    pub iterations: u64,
    pub faults: u64,
}

/// State shared between a VU task and the scenario that owns it.
#[derive(Debug, Default)]
pub(crate) struct VuShared {
    draining: AtomicBool,
    completed: AtomicU64,
    faults: AtomicU64,
}

impl VuShared {
    pub(crate) fn drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Iterations finished so far. One cut off by an abort is not included.
    pub(crate) fn progress(&self) -> VuReport {
        VuReport {
            iterations: self.completed.load(Ordering::Acquire),
            faults: self.faults.load(Ordering::Acquire),
        }
    }

    fn publish(&self, report: VuReport) {
        self.faults.store(report.faults, Ordering::Release);
        self.completed.store(report.iterations, Ordering::Release);
    }
}

/// The loop a VU task runs.
pub(crate) struct VuRunner {
    ctx: VuContext,
    iteration: Arc<dyn Iteration>,
    shared: Arc<VuShared>,
    samples: SampleSender,
}

impl VuRunner {
    pub(crate) fn new(
        ctx: VuContext,
        iteration: Arc<dyn Iteration>,
        shared: Arc<VuShared>,
        samples: SampleSender,
    ) -> Self {
        Self {
            ctx,
            iteration,
            shared,
            samples,
        }
    }

    pub(crate) async fn run(mut self) -> VuReport {
        let mut report = VuReport::default();
        tracing::debug!("VU {} running", self.ctx.id);

        while !self.shared.is_draining() {
            report.iterations += 1;
            self.ctx.begin_iteration(report.iterations);
            if let IterationOutcome::Faulted(_) = self.run_once().await {
                report.faults += 1;
            }
            self.samples.send(self.ctx.take_samples());
            self.shared.publish(report);
            // Keep the control loop and other VUs responsive even when an
            // iteration never suspends.
            tokio::task::yield_now().await;
        }

        tracing::debug!(
            "VU {} stopped after {} iterations ({} faults)",
            self.ctx.id,
            report.iterations,
            report.faults
        );
        report
    }

    async fn run_once(&mut self) -> IterationOutcome {
        let iteration = self.iteration.clone();
        let started = self.ctx.elapsed();

        let result = AssertUnwindSafe(iteration.run(&mut self.ctx))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(())) => IterationOutcome::Completed,
            Ok(Err(e)) => IterationOutcome::Faulted(e),
            Err(panic) => IterationOutcome::Faulted(IterationError::Panicked(panic_message(
                panic.as_ref(),
            ))),
        };

        let duration = self.ctx.elapsed().saturating_sub(started);
        if let IterationOutcome::Faulted(e) = &outcome {
            tracing::debug!(
                "VU {} iteration {} faulted: {}",
                self.ctx.id,
                self.ctx.iteration,
                e
            );
            self.ctx.record_check(builtin::ITERATION_CHECK, false);
            self.ctx
                .record_tagged(builtin::ITERATION_FAULTS, MetricKind::Counter, 1.0, &[]);
        }
        self.ctx
            .record_tagged(builtin::ITERATIONS, MetricKind::Counter, 1.0, &[]);
        self.ctx.record_tagged(
            builtin::ITERATION_DURATION,
            MetricKind::Trend,
            millis(duration),
            &[],
        );
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
