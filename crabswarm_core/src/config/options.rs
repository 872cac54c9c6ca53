//! Serde model of an options document, before validation.
//!
//! Field names follow the k6 `options` object (camelCase, `maxVUs`,
//! `startVUs`). Numbers that must not be negative are read as signed so a
//! negative value surfaces as a [`ConfigError`](crate::error::ConfigError)
//! naming the scenario instead of a bare parse error.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use super::duration::{from_secs, parse_duration};
use crate::error::ConfigError;
use crate::metrics::{Tags, TrendStorage};
use crate::thresholds::InconclusivePolicy;

/// A duration written either as a string (`"1m30s"`) or as seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Text(String),
    Seconds(f64),
}

impl DurationValue {
    pub fn resolve(&self) -> Result<Duration, ConfigError> {
        match self {
            DurationValue::Text(raw) => parse_duration(raw),
            DurationValue::Seconds(secs) => {
                from_secs(*secs).ok_or_else(|| ConfigError::InvalidDuration(secs.to_string()))
            }
        }
    }
}

/// Resolve an optional duration, falling back to `default` when absent.
pub(crate) fn resolve_or(
    value: Option<&DurationValue>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), DurationValue::resolve)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioOptions>,

    /// Shorthand for a single ramping scenario named `default`
    #[serde(default)]
    pub stages: Vec<StageOptions>,
    /// With `duration`: shorthand for a constant scenario. With `stages`: its start VUs.
    pub vus: Option<i64>,
    pub duration: Option<DurationValue>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdList>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(rename = "maxVUs")]
    pub max_vus: Option<u64>,

    pub tick_interval: Option<DurationValue>,
    pub threshold_interval: Option<DurationValue>,
    /// Hard limit on the whole run; VUs still get their graceful stop
    pub deadline: Option<DurationValue>,
    #[serde(default)]
    pub inconclusive: InconclusivePolicy,
    #[serde(default)]
    pub trend_storage: TrendStorage,
}

impl RunOptions {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) fn uses_shorthand(&self) -> bool {
        !self.stages.is_empty() || self.vus.is_some() || self.duration.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOptions {
    pub executor: String,
    #[serde(rename = "startVUs")]
    pub start_vus: Option<i64>,
    #[serde(default)]
    pub stages: Vec<StageOptions>,
    pub vus: Option<i64>,
    pub duration: Option<DurationValue>,
    pub start_time: Option<DurationValue>,
    pub graceful_stop: Option<DurationValue>,
    pub graceful_ramp_down: Option<DurationValue>,
    #[serde(rename = "maxVUs")]
    pub max_vus: Option<u64>,
    pub exec: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageOptions {
    pub duration: DurationValue,
    pub target: i64,
}

/// A metric's thresholds: one entry or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdList {
    One(ThresholdEntry),
    Many(Vec<ThresholdEntry>),
}

impl ThresholdList {
    pub fn entries(&self) -> &[ThresholdEntry] {
        match self {
            ThresholdList::One(entry) => std::slice::from_ref(entry),
            ThresholdList::Many(entries) => entries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedThreshold {
    pub threshold: String,
    #[serde(default)]
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<DurationValue>,
}
