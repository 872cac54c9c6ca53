//! Test doubles for the engine's two external seams: the HTTP client and the
//! iteration function.
//!
//! Every double that does work awaits a tokio timer, so runs under paused
//! time advance on their own instead of spinning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crabswarm_core::metrics::{CounterSnapshot, RateSnapshot, TrendSnapshot};
use crabswarm_core::{
    Engine, EngineError, HttpClient, HttpResponse, Iteration, IterationError, IterationRegistry,
    Method, RunConfig, RunResult, SinkSnapshot, TransportError, VuContext,
};
use parking_lot::Mutex;

/// Scripted HTTP client.
///
/// Answers every request after `latency` with `status`, except for URLs with
/// a status override, and fails every `fail_every`-th request with a
/// connection error.
pub struct MockHttpClient {
    latency: Duration,
    status: u16,
    body: String,
    fail_every: Option<u64>,
    overrides: HashMap<String, u16>,
    requests: AtomicU64,
    log: Mutex<Vec<(Method, String)>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(10),
            status: 200,
            body: "<html>ok</html>".to_string(),
            fail_every: None,
            overrides: HashMap::new(),
            requests: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Fail every `n`-th request (1-based) with a transport error
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn with_route(mut self, url: impl Into<String>, status: u16) -> Self {
        self.overrides.insert(url.into(), status);
        self
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.log.lock().iter().map(|(_, url)| url.clone()).collect()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn request(&self, method: Method, url: &str) -> Result<HttpResponse, TransportError> {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.log.lock().push((method, url.to_string()));
        tokio::time::sleep(self.latency).await;

        if matches!(self.fail_every, Some(every) if n % every == 0) {
            return Err(TransportError::Connection(format!("{} refused", url)));
        }
        Ok(HttpResponse {
            status: self.overrides.get(url).copied().unwrap_or(self.status),
            body: self.body.clone(),
            duration: self.latency,
        })
    }
}

/// GETs `url`, checks the status, then thinks for `think_time`.
pub struct CheckingIteration {
    pub url: String,
    pub expected_status: u16,
    pub think_time: Duration,
}

impl CheckingIteration {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected_status: 200,
            think_time: Duration::ZERO,
        }
    }

    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }
}

#[async_trait]
impl Iteration for CheckingIteration {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        let res = ctx.get(&self.url).await?;
        let expected = self.expected_status;
        ctx.check(&res)
            .that(&format!("status is {}", expected), |r| r.status == expected)
            .that("body is not empty", |r| !r.body.is_empty());
        if !self.think_time.is_zero() {
            ctx.sleep(self.think_time).await;
        }
        Ok(())
    }
}

/// Waits `delay`, then fails.
pub struct FaultingIteration {
    pub delay: Duration,
}

#[async_trait]
impl Iteration for FaultingIteration {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        ctx.sleep(self.delay).await;
        Err(IterationError::failed(format!(
            "VU {} gave up on iteration {}",
            ctx.id(),
            ctx.iteration()
        )))
    }
}

/// Waits `delay`, then panics.
pub struct PanickingIteration {
    pub delay: Duration,
}

#[async_trait]
impl Iteration for PanickingIteration {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        ctx.sleep(self.delay).await;
        panic!("iteration {} exploded", ctx.iteration());
    }
}

/// Only sleeps. With a long duration it models a VU stuck in think time.
pub struct SleepingIteration(pub Duration);

#[async_trait]
impl Iteration for SleepingIteration {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        ctx.sleep(self.0).await;
        Ok(())
    }
}

/// Records `outcome` in a custom rate and a request in a custom counter.
pub struct CustomMetricsIteration;

#[async_trait]
impl Iteration for CustomMetricsIteration {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        let ok = match ctx.get("http://test.local/products").await {
            Ok(res) => res.is_success(),
            Err(_) => false,
        };
        ctx.rate("product_page_errors").add_bool(!ok);
        ctx.counter("products_viewed").add(1.0);
        ctx.trend("render_time").add(if ok { 42.0 } else { 0.0 });
        Ok(())
    }
}

/// Builder for an engine run against test doubles.
pub struct TestRun {
    config: RunConfig,
    http: Arc<dyn HttpClient>,
    iterations: IterationRegistry,
}

impl TestRun {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            http: Arc::new(MockHttpClient::new()),
            iterations: IterationRegistry::new(),
        }
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = http;
        self
    }

    /// Replaces every registered iteration with `iterations`
    pub fn with_iterations(mut self, iterations: IterationRegistry) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn register(mut self, name: &str, iteration: impl Iteration + 'static) -> Self {
        self.iterations.register(name, iteration);
        self
    }

    pub fn engine(self) -> Result<Engine, EngineError> {
        Engine::new(self.config, self.iterations, self.http)
    }

    pub async fn run(self) -> Result<RunResult, EngineError> {
        self.engine()?.run().await
    }
}

pub fn counter(result: &RunResult, key: &str) -> Option<CounterSnapshot> {
    match result.metric(key)? {
        SinkSnapshot::Counter(c) => Some(*c),
        _ => None,
    }
}

pub fn rate(result: &RunResult, key: &str) -> Option<RateSnapshot> {
    match result.metric(key)? {
        SinkSnapshot::Rate(r) => Some(*r),
        _ => None,
    }
}

pub fn trend(result: &RunResult, key: &str) -> Option<TrendSnapshot> {
    match result.metric(key)? {
        SinkSnapshot::Trend(t) => Some(t.clone()),
        _ => None,
    }
}
