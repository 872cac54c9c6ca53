//! Threshold rules and their evaluation.
//!
//! A rule pairs a metric key with an expression such as `p(95)<1000` or
//! `rate<0.1`. Rules are evaluated live at a fixed cadence and once more,
//! authoritatively, when the run ends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::{builtin, MetricKey, MetricKind, SinkSnapshot, Snapshots};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregation {
    /// Whether a metric of `kind` can produce this aggregation.
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Aggregation::Count | Aggregation::Rate),
            MetricKind::Rate => matches!(self, Aggregation::Rate),
            MetricKind::Trend => !matches!(self, Aggregation::Rate),
        }
    }

    fn value(&self, snapshot: &SinkSnapshot) -> Option<f64> {
        match (self, snapshot) {
            (Aggregation::Count, SinkSnapshot::Counter(c)) => Some(c.count),
            (Aggregation::Rate, SinkSnapshot::Counter(c)) => Some(c.rate),
            (Aggregation::Rate, SinkSnapshot::Rate(r)) => Some(r.rate),
            (Aggregation::Count, SinkSnapshot::Trend(t)) => Some(t.count() as f64),
            (Aggregation::Avg, SinkSnapshot::Trend(t)) => t.avg(),
            (Aggregation::Min, SinkSnapshot::Trend(t)) => t.min(),
            (Aggregation::Max, SinkSnapshot::Trend(t)) => t.max(),
            (Aggregation::Med, SinkSnapshot::Trend(t)) => t.med(),
            (Aggregation::Percentile(p), SinkSnapshot::Trend(t)) => t.percentile(*p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Eq => left == right,
            Comparison::Ne => left != right,
        }
    }
}

/// Parsed `<aggregation> <op> <bound>` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
    source: String,
}

impl ThresholdExpr {
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| format!("missing comparison operator in '{}'", raw))?;
        let (lhs, rest) = compact.split_at(op_at);

        let (comparison, rhs) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .into_iter()
        .find_map(|(op, cmp)| rest.strip_prefix(op).map(|rhs| (cmp, rhs)))
        .ok_or_else(|| format!("unknown comparison operator in '{}'", raw))?;

        let bound: f64 = rhs
            .parse()
            .ok()
            .filter(|b: &f64| b.is_finite())
            .ok_or_else(|| format!("invalid bound '{}' in '{}'", rhs, raw))?;

        let aggregation = match lhs {
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation '{}' in '{}'", other, raw))?;
                let p: f64 = inner
                    .parse()
                    .map_err(|_| format!("invalid percentile '{}' in '{}'", inner, raw))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {} outside 0..=100 in '{}'", p, raw));
                }
                Aggregation::Percentile(p)
            }
        };

        Ok(Self {
            aggregation,
            comparison,
            bound,
            source: raw.trim().to_string(),
        })
    }
}

/// One pass/fail rule over an aggregated metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: MetricKey,
    pub expr: ThresholdExpr,
    /// Stop the run as soon as a live evaluation fails
    pub abort_on_fail: bool,
    /// Run time to wait before a live failure may abort
    pub delay_abort_eval: Duration,
}

impl ThresholdRule {
    pub fn new(metric: MetricKey, expr: ThresholdExpr) -> Self {
        Self {
            metric,
            expr,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        }
    }

    pub fn parse(metric: &str, expr: &str) -> Result<Self, String> {
        let metric = MetricKey::parse(metric).map_err(|e| e.to_string())?;
        Ok(Self::new(metric, expr.parse()?))
    }

    /// Stable identifier, `"<metric>: <expression>"`
    pub fn key(&self) -> String {
        format!("{}: {}", self.metric, self.expr)
    }

    /// Kind the metric must have, when it is one of the engine's own.
    pub fn expected_kind(&self) -> Option<MetricKind> {
        builtin::kind_of(&self.metric.name)
    }

    pub fn evaluate(&self, snapshot: Option<&SinkSnapshot>) -> Outcome {
        let Some(snapshot) = snapshot.filter(|s| s.samples() > 0) else {
            return Outcome::Inconclusive;
        };
        match self.expr.aggregation.value(snapshot) {
            Some(observed) if self.expr.comparison.holds(observed, self.expr.bound) => {
                Outcome::Pass
            }
            Some(_) => Outcome::Fail,
            None => {
                tracing::warn!(
                    "Threshold '{}' does not apply to {} metric",
                    self.key(),
                    snapshot.kind()
                );
                Outcome::Inconclusive
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    /// The metric has no samples
    Inconclusive,
}

/// What an `Inconclusive` final outcome means for the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InconclusivePolicy {
    /// Reported, but does not fail the run
    #[default]
    Ignore,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub rule: String,
    pub metric: String,
    pub expression: String,
    pub outcome: Outcome,
    /// Observed aggregation at final evaluation, when available
    pub observed: Option<f64>,
}

pub struct ThresholdEvaluator {
    rules: Vec<ThresholdRule>,
    policy: InconclusivePolicy,
}

impl ThresholdEvaluator {
    pub fn new(rules: Vec<ThresholdRule>, policy: InconclusivePolicy) -> Self {
        Self { rules, policy }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    pub fn evaluate(&self, snapshots: &Snapshots) -> BTreeMap<String, Outcome> {
        self.rules
            .iter()
            .map(|rule| {
                let snapshot = snapshots.get(&rule.metric.to_string());
                (rule.key(), rule.evaluate(snapshot))
            })
            .collect()
    }

    /// First abort-on-fail rule that failed once its delay has passed.
    pub fn abort_trigger(
        &self,
        outcomes: &BTreeMap<String, Outcome>,
        elapsed: Duration,
    ) -> Option<&ThresholdRule> {
        self.rules.iter().find(|rule| {
            rule.abort_on_fail
                && elapsed >= rule.delay_abort_eval
                && outcomes.get(&rule.key()) == Some(&Outcome::Fail)
        })
    }

    /// Run-level verdict over final outcomes.
    pub fn passed(&self, outcomes: &BTreeMap<String, Outcome>) -> bool {
        outcomes.values().all(|outcome| match outcome {
            Outcome::Pass => true,
            Outcome::Fail => false,
            Outcome::Inconclusive => self.policy == InconclusivePolicy::Ignore,
        })
    }

    pub fn report(&self, snapshots: &Snapshots) -> Vec<ThresholdReport> {
        self.rules
            .iter()
            .map(|rule| {
                let snapshot = snapshots.get(&rule.metric.to_string());
                ThresholdReport {
                    rule: rule.key(),
                    metric: rule.metric.to_string(),
                    expression: rule.expr.to_string(),
                    outcome: rule.evaluate(snapshot),
                    observed: snapshot.and_then(|s| rule.expr.aggregation.value(s)),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricKind, MetricRegistry, MetricSample};

    fn registry_with_rate(name: &str, failures: u64, total: u64) -> Snapshots {
        let registry = MetricRegistry::default();
        for i in 0..total {
            let value = if i < failures { 1.0 } else { 0.0 };
            registry
                .ingest(&MetricSample::new(name, MetricKind::Rate, value, Duration::ZERO))
                .unwrap();
        }
        registry.snapshot(Duration::from_secs(1))
    }

    #[test]
    fn test_parse_expressions() {
        let expr: ThresholdExpr = "p(95)<1000".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(expr.comparison, Comparison::Lt);
        assert_eq!(expr.bound, 1000.0);

        let expr: ThresholdExpr = " rate <= 0.1 ".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Rate);
        assert_eq!(expr.comparison, Comparison::Le);
        assert_eq!(expr.source(), "rate <= 0.1");

        let expr: ThresholdExpr = "p(99.9)>=2".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(99.9));
        assert_eq!(expr.comparison, Comparison::Ge);

        for (raw, cmp) in [
            ("avg>1", Comparison::Gt),
            ("count==3", Comparison::Eq),
            ("med!=3", Comparison::Ne),
        ] {
            assert_eq!(raw.parse::<ThresholdExpr>().unwrap().comparison, cmp);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "p95<1",
            "p(101)<1",
            "rate<abc",
            "rate",
            "rate=<1",
            "value<1",
            "avg<inf",
        ] {
            assert!(raw.parse::<ThresholdExpr>().is_err(), "{} parsed", raw);
        }
    }

    #[test]
    fn test_failure_rate_threshold() {
        let rule = ThresholdRule::parse("http_req_failed", "rate<0.1").unwrap();
        let evaluator = ThresholdEvaluator::new(vec![rule], InconclusivePolicy::Ignore);

        let outcomes = evaluator.evaluate(&registry_with_rate("http_req_failed", 15, 100));
        assert_eq!(outcomes["http_req_failed: rate<0.1"], Outcome::Fail);
        assert!(!evaluator.passed(&outcomes));

        let outcomes = evaluator.evaluate(&registry_with_rate("http_req_failed", 5, 100));
        assert_eq!(outcomes["http_req_failed: rate<0.1"], Outcome::Pass);
        assert!(evaluator.passed(&outcomes));
    }

    #[test]
    fn test_zero_samples_is_inconclusive() {
        let rule = ThresholdRule::parse("search_duration", "p(95)<1000").unwrap();
        assert_eq!(rule.evaluate(None), Outcome::Inconclusive);

        let snapshots = registry_with_rate("http_req_failed", 0, 0);
        let rule = ThresholdRule::parse("http_req_failed", "rate<0.1").unwrap();
        assert_eq!(
            rule.evaluate(snapshots.get("http_req_failed")),
            Outcome::Inconclusive
        );
    }

    #[test]
    fn test_inconclusive_policy() {
        let rule = ThresholdRule::parse("search_duration", "p(95)<1000").unwrap();
        let snapshots = Snapshots::new();

        let lenient = ThresholdEvaluator::new(vec![rule.clone()], InconclusivePolicy::Ignore);
        let outcomes = lenient.evaluate(&snapshots);
        assert_eq!(outcomes.values().next(), Some(&Outcome::Inconclusive));
        assert!(lenient.passed(&outcomes));

        let strict = ThresholdEvaluator::new(vec![rule], InconclusivePolicy::Fail);
        assert!(!strict.passed(&strict.evaluate(&snapshots)));
    }

    #[test]
    fn test_trend_aggregations() {
        let registry = MetricRegistry::default();
        for v in [100.0, 200.0, 300.0, 400.0, 2000.0] {
            registry
                .ingest(&MetricSample::new(
                    "http_req_duration",
                    MetricKind::Trend,
                    v,
                    Duration::ZERO,
                ))
                .unwrap();
        }
        let snapshots = registry.snapshot(Duration::from_secs(1));
        let check = |expr: &str| {
            ThresholdRule::parse("http_req_duration", expr)
                .unwrap()
                .evaluate(snapshots.get("http_req_duration"))
        };

        assert_eq!(check("med<=300"), Outcome::Pass);
        assert_eq!(check("avg<600"), Outcome::Fail);
        assert_eq!(check("min>=100"), Outcome::Pass);
        assert_eq!(check("max<1500"), Outcome::Fail);
        assert_eq!(check("p(95)<1500"), Outcome::Fail);
        assert_eq!(check("p(50)<1500"), Outcome::Pass);
        assert_eq!(check("count==5"), Outcome::Pass);
        assert_eq!(check("rate<1"), Outcome::Inconclusive);
    }

    #[test]
    fn test_abort_trigger_respects_delay() {
        let mut rule = ThresholdRule::parse("http_req_failed", "rate<0.1").unwrap();
        rule.abort_on_fail = true;
        rule.delay_abort_eval = Duration::from_secs(10);
        let evaluator = ThresholdEvaluator::new(vec![rule], InconclusivePolicy::Ignore);

        let outcomes = evaluator.evaluate(&registry_with_rate("http_req_failed", 50, 100));
        assert!(evaluator
            .abort_trigger(&outcomes, Duration::from_secs(5))
            .is_none());
        let trigger = evaluator.abort_trigger(&outcomes, Duration::from_secs(10));
        assert_eq!(
            trigger.map(|r| r.key()),
            Some("http_req_failed: rate<0.1".to_string())
        );
    }

    #[test]
    fn test_report_includes_observed_value() {
        let rule = ThresholdRule::parse("http_req_failed", "rate<0.3").unwrap();
        let evaluator = ThresholdEvaluator::new(vec![rule], InconclusivePolicy::Ignore);
        let report = evaluator.report(&registry_with_rate("http_req_failed", 1, 4));

        assert_eq!(report.len(), 1);
        assert_eq!(report[0].outcome, Outcome::Pass);
        assert_eq!(report[0].observed, Some(0.25));
        assert_eq!(report[0].metric, "http_req_failed");
    }
}
