//! Run configuration
//!
//! [`RunOptions`] is what the user wrote; [`RunConfig`] is the validated,
//! immutable form the engine runs. All configuration errors surface from
//! [`RunConfig::from_options`], before any VU starts.

pub mod duration;
pub mod options;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::{ExecutorKind, ExecutorSpec, Stage};
use crate::metrics::{Tags, TrendStorage};
use crate::thresholds::{InconclusivePolicy, ThresholdRule};
use crate::vu::DEFAULT_EXEC;

pub use duration::{format_duration, parse_duration};
pub use options::{DurationValue, RunOptions, ScenarioOptions, StageOptions, ThresholdEntry};

use options::resolve_or;

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);
/// Scenario name used for the `stages` / `vus`+`duration` shorthand
pub const DEFAULT_SCENARIO: &str = "default";

/// One validated scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioSpec {
    pub name: String,
    pub executor: ExecutorSpec,
    /// Offset from run start
    pub start_time: Duration,
    /// Grace given to in-flight iterations once the timeline ends
    pub graceful_stop: Duration,
    pub max_vus: Option<u64>,
    pub tags: Tags,
    pub exec: String,
}

impl ScenarioSpec {
    pub fn ramping(name: &str, start_vus: u64, stages: Vec<Stage>) -> Self {
        Self::with_executor(
            name,
            ExecutorSpec::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down: DEFAULT_GRACEFUL_RAMP_DOWN,
            },
        )
    }

    pub fn constant(name: &str, vus: u64, duration: Duration) -> Self {
        Self::with_executor(name, ExecutorSpec::ConstantVus { vus, duration })
    }

    fn with_executor(name: &str, executor: ExecutorSpec) -> Self {
        Self {
            name: name.to_string(),
            executor,
            start_time: Duration::ZERO,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            max_vus: None,
            tags: Tags::new(),
            exec: DEFAULT_EXEC.to_string(),
        }
    }

    pub fn peak_vus(&self) -> u64 {
        self.executor.build().peak_vus()
    }

    /// Latest offset from run start at which this scenario may still hold VUs.
    pub fn end(&self) -> Duration {
        self.start_time
            .saturating_add(self.executor.build().timeline())
            .saturating_add(self.graceful_stop)
    }

    /// [`end`](Self::end), or `None` when it does not fit in a `Duration`.
    pub fn checked_end(&self) -> Option<Duration> {
        self.start_time
            .checked_add(self.executor.checked_timeline()?)?
            .checked_add(self.graceful_stop)
    }
}

/// Validated, immutable configuration of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub scenarios: Vec<ScenarioSpec>,
    pub thresholds: Vec<ThresholdRule>,
    pub tags: Tags,
    /// Run-wide VU budget across all scenarios
    pub max_vus: Option<u64>,
    pub tick_interval: Duration,
    pub threshold_interval: Duration,
    pub deadline: Option<Duration>,
    pub inconclusive: InconclusivePolicy,
    pub trend_storage: TrendStorage,
}

impl RunConfig {
    pub fn new(scenarios: Vec<ScenarioSpec>) -> Self {
        Self {
            scenarios,
            thresholds: Vec::new(),
            tags: Tags::new(),
            max_vus: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
            deadline: None,
            inconclusive: InconclusivePolicy::default(),
            trend_storage: TrendStorage::default(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Self::from_options(RunOptions::from_json_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_options(options: RunOptions) -> Result<Self, ConfigError> {
        let scenarios = if options.scenarios.is_empty() {
            vec![shorthand_scenario(&options)?]
        } else {
            if options.uses_shorthand() {
                return Err(ConfigError::Conflict(
                    "'scenarios' cannot be combined with top-level stages, vus or duration"
                        .to_string(),
                ));
            }
            options
                .scenarios
                .iter()
                .map(|(name, scenario)| scenario_from_options(name, scenario))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut thresholds = Vec::new();
        for (metric, list) in &options.thresholds {
            for entry in list.entries() {
                thresholds.push(threshold_from_entry(metric, entry)?);
            }
        }

        let config = Self {
            scenarios,
            thresholds,
            tags: options.tags.clone(),
            max_vus: options.max_vus,
            tick_interval: resolve_or(options.tick_interval.as_ref(), DEFAULT_TICK_INTERVAL)?,
            threshold_interval: resolve_or(
                options.threshold_interval.as_ref(),
                DEFAULT_THRESHOLD_INTERVAL,
            )?,
            deadline: options
                .deadline
                .as_ref()
                .map(DurationValue::resolve)
                .transpose()?,
            inconclusive: options.inconclusive,
            trend_storage: options.trend_storage,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that hold across scenarios and settings. Also applied to
    /// configurations built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        if self.tick_interval.is_zero() || self.threshold_interval.is_zero() {
            return Err(ConfigError::Conflict(
                "tickInterval and thresholdInterval must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            validate_name(&scenario.name)?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(ConfigError::Conflict(format!(
                    "duplicate scenario name '{}'",
                    scenario.name
                )));
            }
            validate_executor(&scenario.name, &scenario.executor)?;
            if scenario.checked_end().is_none() {
                return Err(ConfigError::DurationOverflow(scenario.name.clone()));
            }
            if let Some(max_vus) = scenario.max_vus {
                let peak = scenario.peak_vus();
                if max_vus < peak {
                    return Err(ConfigError::MaxVusBelowPeak {
                        scenario: scenario.name.clone(),
                        max_vus,
                        peak,
                    });
                }
            }
        }

        let mut keys = HashSet::new();
        for rule in &self.thresholds {
            if !keys.insert(rule.key()) {
                return Err(ConfigError::InvalidThreshold {
                    metric: rule.metric.to_string(),
                    reason: format!("'{}' is listed more than once", rule.expr),
                });
            }
            if let Some(kind) = rule.expected_kind() {
                if !rule.expr.aggregation.applies_to(kind) {
                    return Err(ConfigError::InvalidThreshold {
                        metric: rule.metric.to_string(),
                        reason: format!("'{}' does not apply to a {} metric", rule.expr, kind),
                    });
                }
            }
        }

        if let Some(budget) = self.max_vus {
            self.check_budget(budget)?;
        }
        Ok(())
    }

    /// Sum the peaks of every scenario that may hold VUs at each scenario's
    /// start offset; the busiest instant must fit the budget.
    fn check_budget(&self, budget: u64) -> Result<(), ConfigError> {
        for at in self.scenarios.iter().map(|s| s.start_time) {
            let required: u64 = self
                .scenarios
                .iter()
                .filter(|s| s.start_time <= at && at < s.end())
                .map(ScenarioSpec::peak_vus)
                .sum();
            if required > budget {
                return Err(ConfigError::VuBudgetExceeded {
                    required,
                    budget,
                    at,
                });
            }
        }
        Ok(())
    }

    /// Time by which every scenario is over, graceful stops included
    pub fn max_duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(ScenarioSpec::end)
            .max()
            .unwrap_or_default()
    }
}

fn shorthand_scenario(options: &RunOptions) -> Result<ScenarioSpec, ConfigError> {
    let name = DEFAULT_SCENARIO;
    let vus = non_negative(name, options.vus.unwrap_or(1))?;

    if !options.stages.is_empty() {
        if options.duration.is_some() {
            return Err(ConfigError::Conflict(
                "top-level 'stages' cannot be combined with 'duration'".to_string(),
            ));
        }
        return Ok(ScenarioSpec::ramping(
            name,
            vus,
            stages_from_options(name, &options.stages)?,
        ));
    }

    match &options.duration {
        Some(duration) => {
            let duration = duration.resolve()?;
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(name.to_string()));
            }
            Ok(ScenarioSpec::constant(name, vus, duration))
        }
        None => Err(ConfigError::NoScenarios),
    }
}

fn scenario_from_options(name: &str, options: &ScenarioOptions) -> Result<ScenarioSpec, ConfigError> {
    validate_name(name)?;
    let kind: ExecutorKind = options
        .executor
        .parse()
        .map_err(|executor| ConfigError::UnknownExecutor {
            scenario: name.to_string(),
            executor,
        })?;

    let executor = match kind {
        ExecutorKind::RampingVus => {
            if options.vus.is_some() || options.duration.is_some() {
                return Err(ConfigError::Conflict(format!(
                    "scenario '{}': ramping-vus takes startVUs and stages, not vus/duration",
                    name
                )));
            }
            ExecutorSpec::RampingVus {
                start_vus: non_negative(name, options.start_vus.unwrap_or(1))?,
                stages: stages_from_options(name, &options.stages)?,
                graceful_ramp_down: resolve_or(
                    options.graceful_ramp_down.as_ref(),
                    DEFAULT_GRACEFUL_RAMP_DOWN,
                )?,
            }
        }
        ExecutorKind::ConstantVus => {
            if !options.stages.is_empty()
                || options.start_vus.is_some()
                || options.graceful_ramp_down.is_some()
            {
                return Err(ConfigError::Conflict(format!(
                    "scenario '{}': constant-vus takes vus and duration only",
                    name
                )));
            }
            let duration = resolve_or(options.duration.as_ref(), Duration::ZERO)?;
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration(name.to_string()));
            }
            ExecutorSpec::ConstantVus {
                vus: non_negative(name, options.vus.unwrap_or(1))?,
                duration,
            }
        }
    };

    Ok(ScenarioSpec {
        name: name.to_string(),
        executor,
        start_time: resolve_or(options.start_time.as_ref(), Duration::ZERO)?,
        graceful_stop: resolve_or(options.graceful_stop.as_ref(), DEFAULT_GRACEFUL_STOP)?,
        max_vus: options.max_vus,
        tags: options.tags.clone(),
        exec: options
            .exec
            .clone()
            .unwrap_or_else(|| DEFAULT_EXEC.to_string()),
    })
}

fn stages_from_options(scenario: &str, stages: &[StageOptions]) -> Result<Vec<Stage>, ConfigError> {
    if stages.is_empty() {
        return Err(ConfigError::EmptyStages(scenario.to_string()));
    }
    stages
        .iter()
        .map(|stage| {
            Ok(Stage::new(
                stage.duration.resolve()?,
                non_negative(scenario, stage.target)?,
            ))
        })
        .collect()
}

fn threshold_from_entry(metric: &str, entry: &ThresholdEntry) -> Result<ThresholdRule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidThreshold {
        metric: metric.to_string(),
        reason,
    };
    match entry {
        ThresholdEntry::Expr(expr) => ThresholdRule::parse(metric, expr).map_err(invalid),
        ThresholdEntry::Detailed(detailed) => {
            let mut rule = ThresholdRule::parse(metric, &detailed.threshold).map_err(invalid)?;
            rule.abort_on_fail = detailed.abort_on_fail;
            rule.delay_abort_eval = resolve_or(detailed.delay_abort_eval.as_ref(), Duration::ZERO)?;
            Ok(rule)
        }
    }
}

fn validate_executor(scenario: &str, executor: &ExecutorSpec) -> Result<(), ConfigError> {
    match executor {
        ExecutorSpec::RampingVus { stages, .. } if stages.is_empty() => {
            Err(ConfigError::EmptyStages(scenario.to_string()))
        }
        ExecutorSpec::ConstantVus { duration, .. } if duration.is_zero() => {
            Err(ConfigError::ZeroDuration(scenario.to_string()))
        }
        _ => Ok(()),
    }
}

/// Scenario names end up in tags and metric selectors.
fn validate_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidScenarioName(name.to_string()))
    }
}

fn non_negative(scenario: &str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::NegativeTarget {
        scenario: scenario.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> Result<RunConfig, ConfigError> {
        RunConfig::from_options(RunOptions::from_value(value)?)
    }

    #[test]
    fn test_stage_shorthand_becomes_default_scenario() {
        let config = config(json!({
            "stages": [
                {"duration": "30s", "target": 10},
                {"duration": "1m", "target": 10},
                {"duration": "30s", "target": 0}
            ],
            "thresholds": {"http_req_duration": ["p(95)<1000"]},
            "tags": {"project": "homepage"}
        }))
        .unwrap();

        assert_eq!(config.scenarios.len(), 1);
        let scenario = &config.scenarios[0];
        assert_eq!(scenario.name, DEFAULT_SCENARIO);
        assert_eq!(scenario.exec, DEFAULT_EXEC);
        assert_eq!(scenario.graceful_stop, DEFAULT_GRACEFUL_STOP);
        assert_eq!(scenario.peak_vus(), 10);
        assert_eq!(config.thresholds.len(), 1);
        assert_eq!(config.tags["project"], "homepage");
        assert_eq!(config.tick_interval, DEFAULT_TICK_INTERVAL);
        assert_eq!(config.max_duration(), Duration::from_secs(150));
    }

    #[test]
    fn test_vus_duration_shorthand_is_constant() {
        let config = config(json!({"vus": 5, "duration": "10s"})).unwrap();
        assert_eq!(
            config.scenarios[0].executor,
            ExecutorSpec::ConstantVus {
                vus: 5,
                duration: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn test_scenario_defaults_and_overrides() {
        let config = config(json!({
            "scenarios": {
                "browse": {
                    "executor": "ramping-vus",
                    "stages": [{"duration": "5s", "target": 2}],
                    "startTime": "10s",
                    "gracefulStop": "5s",
                    "exec": "navigation",
                    "tags": {"flow": "browse"}
                }
            }
        }))
        .unwrap();

        let scenario = &config.scenarios[0];
        assert_eq!(scenario.start_time, Duration::from_secs(10));
        assert_eq!(scenario.graceful_stop, Duration::from_secs(5));
        assert_eq!(scenario.exec, "navigation");
        assert_eq!(scenario.tags["flow"], "browse");
        match &scenario.executor {
            ExecutorSpec::RampingVus {
                start_vus,
                graceful_ramp_down,
                ..
            } => {
                assert_eq!(*start_vus, 1);
                assert_eq!(*graceful_ramp_down, DEFAULT_GRACEFUL_RAMP_DOWN);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_configuration_errors() {
        let negative = config(json!({"stages": [{"duration": "5s", "target": -1}]}));
        assert!(matches!(negative, Err(ConfigError::NegativeTarget { value: -1, .. })));

        let unknown = config(json!({
            "scenarios": {"s": {"executor": "per-vu-iterations", "vus": 1}}
        }));
        assert!(matches!(unknown, Err(ConfigError::UnknownExecutor { .. })));

        let empty = config(json!({"scenarios": {"s": {"executor": "ramping-vus"}}}));
        assert!(matches!(empty, Err(ConfigError::EmptyStages(_))));

        let zero = config(json!({"scenarios": {"s": {"executor": "constant-vus", "vus": 2}}}));
        assert!(matches!(zero, Err(ConfigError::ZeroDuration(_))));

        let bad_name = config(json!({
            "scenarios": {"spike test": {"executor": "constant-vus", "duration": "1s"}}
        }));
        assert!(matches!(bad_name, Err(ConfigError::InvalidScenarioName(_))));

        assert!(matches!(config(json!({})), Err(ConfigError::NoScenarios)));

        let mixed = config(json!({
            "vus": 3,
            "scenarios": {"s": {"executor": "constant-vus", "duration": "1s"}}
        }));
        assert!(matches!(mixed, Err(ConfigError::Conflict(_))));

        let bad_duration = config(json!({"vus": 1, "duration": "ten seconds"}));
        assert!(matches!(bad_duration, Err(ConfigError::InvalidDuration(_))));

        let unparsable = config(json!({
            "vus": 1, "duration": "1s",
            "thresholds": {"http_req_duration": "p95 below 100"}
        }));
        assert!(matches!(unparsable, Err(ConfigError::InvalidThreshold { .. })));

        let wrong_aggregation = config(json!({
            "vus": 1, "duration": "1s",
            "thresholds": {"http_req_failed": "p(95)<0.1"}
        }));
        assert!(matches!(wrong_aggregation, Err(ConfigError::InvalidThreshold { .. })));

        let below_peak = config(json!({
            "scenarios": {"s": {
                "executor": "ramping-vus",
                "stages": [{"duration": "5s", "target": 20}],
                "maxVUs": 10
            }}
        }));
        assert!(matches!(
            below_peak,
            Err(ConfigError::MaxVusBelowPeak { max_vus: 10, peak: 20, .. })
        ));
    }

    #[test]
    fn test_huge_durations_are_rejected() {
        let seconds = RunConfig::from_json_str(r#"{"vus": 1, "duration": 1e20}"#);
        assert!(matches!(seconds, Err(ConfigError::InvalidDuration(_))));

        let hours = config(json!({"vus": 1, "duration": "99999999999999999999h"}));
        assert!(matches!(hours, Err(ConfigError::InvalidDuration(_))));

        let stages = config(json!({
            "stages": [
                {"duration": "5000000000000000000s", "target": 1},
                {"duration": "5000000000000000000s", "target": 1},
                {"duration": "5000000000000000000s", "target": 1},
                {"duration": "5000000000000000000s", "target": 0}
            ]
        }));
        assert!(matches!(stages, Err(ConfigError::DurationOverflow(_))));

        let late = config(json!({
            "scenarios": {"late": {
                "executor": "constant-vus", "duration": "1s",
                "startTime": "10000000000000000000s",
                "gracefulStop": "10000000000000000000s"
            }}
        }));
        match late {
            Err(ConfigError::DurationOverflow(name)) => assert_eq!(name, "late"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_scenarios_must_fit_budget() {
        let options = json!({
            "maxVUs": 60,
            "scenarios": {
                "load": {
                    "executor": "constant-vus", "vus": 40, "duration": "1m",
                    "gracefulStop": "0s"
                },
                "spike": {
                    "executor": "ramping-vus", "startVUs": 0, "startTime": "30s",
                    "stages": [{"duration": "10s", "target": 30}]
                }
            }
        });
        match config(options) {
            Err(ConfigError::VuBudgetExceeded {
                required,
                budget,
                at,
            }) => {
                assert_eq!(required, 70);
                assert_eq!(budget, 60);
                assert_eq!(at, Duration::from_secs(30));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Same scenarios, no overlap once the spike starts after the load ends
        let sequential = config(json!({
            "maxVUs": 60,
            "scenarios": {
                "load": {
                    "executor": "constant-vus", "vus": 40, "duration": "1m",
                    "gracefulStop": "0s"
                },
                "spike": {
                    "executor": "ramping-vus", "startVUs": 0, "startTime": "1m",
                    "stages": [{"duration": "10s", "target": 30}]
                }
            }
        }));
        assert!(sequential.is_ok());
    }

    #[test]
    fn test_repeated_threshold_is_rejected() {
        let repeated = config(json!({
            "vus": 1, "duration": "1s",
            "thresholds": {"http_req_failed": ["rate<0.1", "rate<0.1"]}
        }));
        match repeated {
            Err(ConfigError::InvalidThreshold { metric, reason }) => {
                assert_eq!(metric, "http_req_failed");
                assert!(reason.contains("more than once"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }

        let distinct = config(json!({
            "vus": 1, "duration": "1s",
            "thresholds": {"http_req_failed": ["rate<0.1", "rate<0.05"]}
        }));
        assert_eq!(distinct.unwrap().thresholds.len(), 2);
    }

    #[test]
    fn test_detailed_threshold_options() {
        let config = config(json!({
            "vus": 1, "duration": "1s",
            "thresholds": {
                "checks{check:status 200}": [
                    {"threshold": "rate>0.99", "abortOnFail": true, "delayAbortEval": "5s"}
                ]
            }
        }))
        .unwrap();
        let rule = &config.thresholds[0];
        assert!(rule.abort_on_fail);
        assert_eq!(rule.delay_abort_eval, Duration::from_secs(5));
        assert!(rule.metric.is_submetric());
    }
}
