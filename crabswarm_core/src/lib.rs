//! # crabswarm_core
//!
//! Virtual-user scheduling and scenario execution for load tests.
//!
//! A run is described by a [`RunConfig`]: named scenarios, each with an
//! executor (`ramping-vus` or `constant-vus`) that says how many virtual users
//! should be running at any moment, plus threshold rules over the metrics the
//! run produces. The [`Engine`] spawns one tokio task per VU, each repeatedly
//! calling a user-supplied [`Iteration`] with a [`VuContext`] that records
//! checks, HTTP metrics and custom counters, rates and trends.
//!
//! ```ignore
//! use crabswarm_core::{Engine, IterationRegistry, RunConfig};
//!
//! let config = RunConfig::from_json_str(r#"{
//!     "stages": [{"duration": "30s", "target": 10}, {"duration": "30s", "target": 0}],
//!     "thresholds": {"http_req_failed": "rate<0.1"}
//! }"#)?;
//! let mut iterations = IterationRegistry::new();
//! iterations.register("default", MyIteration);
//!
//! let result = Engine::new(config, iterations, http)?.run().await?;
//! std::process::exit(result.exit_code());
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod scheduler;
pub mod thresholds;
pub mod vu;

pub use clock::{Clock, ManualClock, SharedClock, TokioClock};
pub use config::{RunConfig, RunOptions, ScenarioSpec};
pub use context::RunContext;
pub use engine::{AbortReason, Engine, Progress, RunResult, RunStatus};
pub use error::{ConfigError, EngineError, IterationError, MetricError, TransportError};
pub use executor::{Executor, ExecutorKind, ExecutorSpec, Stage};
pub use http::{HttpClient, HttpResponse, Method};
pub use metrics::{MetricKey, MetricKind, MetricRegistry, MetricSample, SinkSnapshot, Tags};
pub use scheduler::{ScenarioState, ScenarioSummary, Scheduler};
pub use thresholds::{InconclusivePolicy, Outcome, ThresholdEvaluator, ThresholdRule};
pub use vu::{CheckOutcome, Iteration, IterationRegistry, VuContext, VuId};
