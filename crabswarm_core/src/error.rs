//! Error types for the crabswarm engine.
//!
//! Only configuration problems and internal task failures are errors at the
//! engine level. Failed checks, faulted iterations and failed thresholds are
//! expected outcomes of a load test and are recorded as metrics instead.

use std::time::Duration;
use thiserror::Error;

use crate::metrics::MetricKind;

/// Problems found while loading or validating run options.
///
/// Every variant is fatal: a run with an invalid configuration never starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A duration string could not be parsed
    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    /// A VU count below zero
    #[error("Scenario '{scenario}': VU count must be non-negative, got {value}")]
    NegativeTarget { scenario: String, value: i64 },

    /// Executor kind not supported by this engine
    #[error("Scenario '{scenario}': unknown executor '{executor}'")]
    UnknownExecutor { scenario: String, executor: String },

    /// A ramping-vus scenario without stages
    #[error("Scenario '{0}': ramping-vus requires at least one stage")]
    EmptyStages(String),

    /// A constant-vus scenario without a usable duration
    #[error("Scenario '{0}': constant-vus requires a non-zero duration")]
    ZeroDuration(String),

    /// Start time, stages and graceful stop add up past `Duration::MAX`
    #[error("Scenario '{0}': total duration is too large")]
    DurationOverflow(String),

    #[error("Invalid scenario name '{0}'")]
    InvalidScenarioName(String),

    #[error("No scenarios configured")]
    NoScenarios,

    /// Shorthand options mixed with explicit scenarios
    #[error("Conflicting options: {0}")]
    Conflict(String),

    /// A scenario references an iteration function nobody registered
    #[error("Scenario '{scenario}': no iteration function registered as '{exec}'")]
    UnknownExec { scenario: String, exec: String },

    #[error("Threshold on '{metric}': {reason}")]
    InvalidThreshold { metric: String, reason: String },

    #[error("Scenario '{scenario}': maxVUs {max_vus} is below the scenario peak of {peak} VUs")]
    MaxVusBelowPeak {
        scenario: String,
        max_vus: u64,
        peak: u64,
    },

    /// Overlapping scenarios need more VUs than the run-wide budget allows
    #[error("Overlapping scenarios need {required} VUs at {at:?}, exceeding maxVUs {budget}")]
    VuBudgetExceeded {
        required: u64,
        budget: u64,
        at: Duration,
    },

    #[error("Failed to parse options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read options file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the opaque request primitive.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Failure raised by an iteration function.
///
/// The VU runner catches these per iteration; they never stop the VU.
#[derive(Debug, Error)]
pub enum IterationError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Iteration failed: {0}")]
    Failed(String),

    #[error("Iteration panicked: {0}")]
    Panicked(String),
}

impl IterationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        IterationError::Failed(reason.into())
    }
}

/// A sample the metric registry refused to ingest.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetricError {
    #[error("Metric '{name}' is a {existing}, cannot record a {attempted} sample")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        attempted: MetricKind,
    },

    #[error("Metric '{name}': counter increments must be non-negative, got {value}")]
    NegativeIncrement { name: String, value: f64 },

    #[error("Metric '{name}': value {value} is not finite")]
    NonFinite { name: String, value: f64 },

    #[error("Metric '{name}': histogram trends only accept non-negative values, got {value}")]
    NegativeHistogramValue { name: String, value: f64 },

    #[error("Invalid metric key '{0}'")]
    InvalidKey(String),
}

/// Errors that stop [`Engine::run`](crate::engine::Engine::run) from producing a result.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The telemetry collector task died before the run finished
    #[error("Telemetry collector failed: {0}")]
    Collector(String),
}
