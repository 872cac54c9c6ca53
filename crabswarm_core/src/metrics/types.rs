//! Metric types

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// Tag set attached to samples; ordered so metric keys render stably.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// One observation produced by a VU.
///
/// Rate samples use `1.0` for true and `0.0` for false.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: String,
    pub kind: MetricKind,
    pub value: f64,
    /// Offset from run start at which the sample was taken
    pub offset: Duration,
    pub tags: Tags,
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, kind: MetricKind, value: f64, offset: Duration) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            offset,
            tags: Tags::new(),
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Metrics the engine records on its own.
pub mod builtin {
    use super::MetricKind;

    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAULTS: &str = "iteration_faults";
    pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
    pub const CHECKS: &str = "checks";
    pub const CHECK_FAILURES: &str = "check_failures";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";

    /// Name of the implicit check recorded when an iteration faults
    pub const ITERATION_CHECK: &str = "iteration completed";

    pub fn kind_of(name: &str) -> Option<MetricKind> {
        match name {
            ITERATIONS | ITERATION_FAULTS | INTERRUPTED_ITERATIONS | HTTP_REQS | DATA_RECEIVED => {
                Some(MetricKind::Counter)
            }
            CHECKS | CHECK_FAILURES | HTTP_REQ_FAILED => Some(MetricKind::Rate),
            ITERATION_DURATION | HTTP_REQ_DURATION => Some(MetricKind::Trend),
            _ => None,
        }
    }
}

/// A metric name plus an optional tag selector, e.g. `http_req_duration{scenario:spike}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub selector: Tags,
}

impl MetricKey {
    pub fn parse(raw: &str) -> Result<Self, MetricError> {
        let raw = raw.trim();
        let Some(open) = raw.find('{') else {
            if raw.is_empty() || raw.contains('}') {
                return Err(MetricError::InvalidKey(raw.to_string()));
            }
            return Ok(Self {
                name: raw.to_string(),
                selector: Tags::new(),
            });
        };

        let name = raw[..open].trim();
        let body = raw[open + 1..]
            .strip_suffix('}')
            .ok_or_else(|| MetricError::InvalidKey(raw.to_string()))?;
        if name.is_empty() {
            return Err(MetricError::InvalidKey(raw.to_string()));
        }

        let mut selector = Tags::new();
        for pair in body.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| MetricError::InvalidKey(raw.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(MetricError::InvalidKey(raw.to_string()));
            }
            selector.insert(key.to_string(), value.trim().to_string());
        }

        Ok(Self {
            name: name.to_string(),
            selector,
        })
    }

    pub fn is_submetric(&self) -> bool {
        !self.selector.is_empty()
    }

    /// True when every selector tag is present on the sample with the same value.
    pub fn matches(&self, tags: &Tags) -> bool {
        self.selector
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.selector.is_empty() {
            return Ok(());
        }
        let pairs: Vec<String> = self
            .selector
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}
