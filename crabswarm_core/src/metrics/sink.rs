//! Metric sinks - Counter, Rate and Trend aggregators
//!
//! Each sink guards its state with a short `parking_lot` critical section so
//! any number of producers can ingest while a reporter snapshots. Snapshots
//! are immutable values; taking two with no ingest in between yields equal
//! results.
//!
//! Trend percentiles use linear interpolation between the closest ranks of
//! the sorted samples (`rank = p/100 * (n - 1)`), so `p(0)` is the minimum and
//! `p(100)` the maximum. The histogram storage keeps 3 significant digits:
//! percentiles carry at most 0.1% relative error plus 1µs of quantisation,
//! while min and max stay exact.

use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};

use super::types::MetricKind;
use crate::error::MetricError;

/// How trend sinks keep their samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendStorage {
    /// Every sample is retained; exact percentiles
    #[default]
    Exact,
    /// HDR histogram with 3 significant digits; bounded memory for long runs
    Histogram,
}

/// Histogram values are recorded in thousandths of the sample unit.
const HISTOGRAM_SCALE: f64 = 1000.0;
const HISTOGRAM_SIGFIG: u8 = 3;

pub struct Sink {
    name: String,
    state: Mutex<SinkState>,
}

enum SinkState {
    Counter { sum: f64, samples: u64 },
    Rate { successes: u64, total: u64 },
    Trend(TrendState),
}

enum TrendState {
    Exact {
        values: Vec<f64>,
        sorted: bool,
        sum: f64,
        /// Last snapshot's copy of `values`, dropped on ingest
        shared: Option<Arc<[f64]>>,
    },
    Histogram {
        hist: Box<Histogram<u64>>,
        min: f64,
        max: f64,
        sum: f64,
    },
}

impl Sink {
    pub fn new(name: impl Into<String>, kind: MetricKind, storage: TrendStorage) -> Self {
        let state = match kind {
            MetricKind::Counter => SinkState::Counter {
                sum: 0.0,
                samples: 0,
            },
            MetricKind::Rate => SinkState::Rate {
                successes: 0,
                total: 0,
            },
            MetricKind::Trend => SinkState::Trend(TrendState::new(storage)),
        };
        Self {
            name: name.into(),
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        match &*self.state.lock() {
            SinkState::Counter { .. } => MetricKind::Counter,
            SinkState::Rate { .. } => MetricKind::Rate,
            SinkState::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn ingest(&self, kind: MetricKind, value: f64) -> Result<(), MetricError> {
        if !value.is_finite() {
            return Err(MetricError::NonFinite {
                name: self.name.clone(),
                value,
            });
        }

        let mut state = self.state.lock();
        match (&mut *state, kind) {
            (SinkState::Counter { sum, samples }, MetricKind::Counter) => {
                if value < 0.0 {
                    return Err(MetricError::NegativeIncrement {
                        name: self.name.clone(),
                        value,
                    });
                }
                *sum += value;
                *samples += 1;
            }
            (SinkState::Rate { successes, total }, MetricKind::Rate) => {
                if value != 0.0 {
                    *successes += 1;
                }
                *total += 1;
            }
            (SinkState::Trend(trend), MetricKind::Trend) => trend.record(&self.name, value)?,
            (existing, attempted) => {
                return Err(MetricError::KindMismatch {
                    name: self.name.clone(),
                    existing: existing.kind(),
                    attempted,
                })
            }
        }
        Ok(())
    }

    /// Point-in-time view. `elapsed` is the run time used for counter rates.
    pub fn snapshot(&self, elapsed: Duration) -> SinkSnapshot {
        let mut state = self.state.lock();
        match &mut *state {
            SinkState::Counter { sum, samples } => {
                SinkSnapshot::Counter(CounterSnapshot::new(*sum, *samples, elapsed))
            }
            SinkState::Rate { successes, total } => {
                SinkSnapshot::Rate(RateSnapshot::new(*successes, *total))
            }
            SinkState::Trend(trend) => SinkSnapshot::Trend(trend.snapshot()),
        }
    }
}

impl SinkState {
    fn kind(&self) -> MetricKind {
        match self {
            SinkState::Counter { .. } => MetricKind::Counter,
            SinkState::Rate { .. } => MetricKind::Rate,
            SinkState::Trend(_) => MetricKind::Trend,
        }
    }
}

impl TrendState {
    fn new(storage: TrendStorage) -> Self {
        match storage {
            TrendStorage::Exact => TrendState::Exact {
                values: Vec::new(),
                sorted: true,
                sum: 0.0,
                shared: None,
            },
            TrendStorage::Histogram => TrendState::Histogram {
                hist: Box::new(empty_histogram()),
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                sum: 0.0,
            },
        }
    }

    fn record(&mut self, name: &str, value: f64) -> Result<(), MetricError> {
        match self {
            TrendState::Exact {
                values,
                sorted,
                sum,
                shared,
            } => {
                *shared = None;
                if let Some(last) = values.last() {
                    if value < *last {
                        *sorted = false;
                    }
                }
                values.push(value);
                *sum += value;
            }
            TrendState::Histogram {
                hist,
                min,
                max,
                sum,
            } => {
                if value < 0.0 {
                    return Err(MetricError::NegativeHistogramValue {
                        name: name.to_string(),
                        value,
                    });
                }
                // Auto-resizing histograms only fail on u64 overflow, which the
                // finite check and scale keep out of reach.
                let _ = hist.record((value * HISTOGRAM_SCALE).round() as u64);
                *min = min.min(value);
                *max = max.max(value);
                *sum += value;
            }
        }
        Ok(())
    }

    fn snapshot(&mut self) -> TrendSnapshot {
        match self {
            TrendState::Exact {
                values,
                sorted,
                sum,
                shared,
            } => {
                if !*sorted {
                    values.sort_by(f64::total_cmp);
                    *sorted = true;
                }
                let sorted_values = shared.get_or_insert_with(|| Arc::from(values.as_slice()));
                TrendSnapshot {
                    count: values.len() as u64,
                    sum: *sum,
                    min: values.first().copied(),
                    max: values.last().copied(),
                    distribution: Distribution::Exact(sorted_values.clone()),
                }
            }
            TrendState::Histogram {
                hist,
                min,
                max,
                sum,
            } => {
                let count = hist.len();
                TrendSnapshot {
                    count,
                    sum: *sum,
                    min: (count > 0).then_some(*min),
                    max: (count > 0).then_some(*max),
                    distribution: Distribution::Histogram(Arc::new((**hist).clone())),
                }
            }
        }
    }
}

/// Immutable statistical view of one sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkSnapshot {
    Counter(CounterSnapshot),
    Rate(RateSnapshot),
    Trend(TrendSnapshot),
}

impl SinkSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            SinkSnapshot::Counter(_) => MetricKind::Counter,
            SinkSnapshot::Rate(_) => MetricKind::Rate,
            SinkSnapshot::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of samples ingested so far
    pub fn samples(&self) -> u64 {
        match self {
            SinkSnapshot::Counter(c) => c.samples,
            SinkSnapshot::Rate(r) => r.total,
            SinkSnapshot::Trend(t) => t.count,
        }
    }

    /// Combine two views of the same metric. `None` when the kinds differ.
    pub fn merge(&self, other: &SinkSnapshot, elapsed: Duration) -> Option<SinkSnapshot> {
        match (self, other) {
            (SinkSnapshot::Counter(a), SinkSnapshot::Counter(b)) => Some(SinkSnapshot::Counter(
                CounterSnapshot::new(a.count + b.count, a.samples + b.samples, elapsed),
            )),
            (SinkSnapshot::Rate(a), SinkSnapshot::Rate(b)) => Some(SinkSnapshot::Rate(
                RateSnapshot::new(a.successes + b.successes, a.total + b.total),
            )),
            (SinkSnapshot::Trend(a), SinkSnapshot::Trend(b)) => {
                Some(SinkSnapshot::Trend(a.merge(b)))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterSnapshot {
    /// Running total
    pub count: f64,
    pub samples: u64,
    /// Total per second of run time
    pub rate: f64,
}

impl CounterSnapshot {
    fn new(count: f64, samples: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { count / secs } else { 0.0 };
        Self {
            count,
            samples,
            rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub successes: u64,
    pub total: u64,
    /// successes / total, 0 when nothing was recorded
    pub rate: f64,
}

impl RateSnapshot {
    fn new(successes: u64, total: u64) -> Self {
        let rate = if total == 0 {
            0.0
        } else {
            successes as f64 / total as f64
        };
        Self {
            successes,
            total,
            rate,
        }
    }

    pub fn failures(&self) -> u64 {
        self.total - self.successes
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Distribution {
    /// Sorted ascending
    Exact(Arc<[f64]>),
    Histogram(Arc<Histogram<u64>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendSnapshot {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    distribution: Distribution,
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn med(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Percentile `p` in `[0, 100]`; `None` without samples.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let p = p.clamp(0.0, 100.0);
        if p == 0.0 {
            return self.min;
        }
        if p == 100.0 {
            return self.max;
        }
        match &self.distribution {
            Distribution::Exact(sorted) => Some(interpolate_rank(sorted, p)),
            Distribution::Histogram(hist) => {
                let raw = hist.value_at_quantile(p / 100.0) as f64 / HISTOGRAM_SCALE;
                // Quantised buckets may overshoot the exact extremes.
                Some(raw.clamp(self.min?, self.max?))
            }
        }
    }

    fn merge(&self, other: &TrendSnapshot) -> TrendSnapshot {
        if !matches!(
            (&self.distribution, &other.distribution),
            (Distribution::Exact(_), Distribution::Exact(_))
        ) {
            if let Distribution::Exact(_) = self.distribution {
                return self.to_histogram_view().merge(other);
            }
            if let Distribution::Exact(_) = other.distribution {
                return self.merge(&other.to_histogram_view());
            }
        }

        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let distribution = match (&self.distribution, &other.distribution) {
            (Distribution::Exact(a), Distribution::Exact(b)) => {
                let mut values: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
                values.sort_by(f64::total_cmp);
                Distribution::Exact(Arc::from(values))
            }
            (a, b) => {
                let mut hist = to_histogram(a);
                // Both sides use the same precision, so adding cannot fail.
                let _ = hist.add(to_histogram(b));
                Distribution::Histogram(Arc::new(hist))
            }
        };
        TrendSnapshot {
            count: self.count + other.count,
            sum: self.sum + other.sum,
            min,
            max,
            distribution,
        }
    }

    /// Same samples in histogram form. Negative values do not fit a
    /// histogram and are left out of every statistic, count included.
    fn to_histogram_view(&self) -> TrendSnapshot {
        let Distribution::Exact(values) = &self.distribution else {
            return self.clone();
        };
        let first_kept = values.partition_point(|v| *v < 0.0);
        let kept = &values[first_kept..];
        TrendSnapshot {
            count: kept.len() as u64,
            sum: if first_kept == 0 {
                self.sum
            } else {
                kept.iter().sum()
            },
            min: kept.first().copied(),
            max: kept.last().copied(),
            distribution: Distribution::Histogram(Arc::new(to_histogram(&self.distribution))),
        }
    }

    fn summary(&self) -> TrendSummary {
        TrendSummary {
            count: self.count,
            min: self.min,
            max: self.max,
            avg: self.avg(),
            med: self.med(),
            p90: self.percentile(90.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

impl Serialize for TrendSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.summary().serialize(serializer)
    }
}

#[derive(Serialize)]
struct TrendSummary {
    count: u64,
    min: Option<f64>,
    max: Option<f64>,
    avg: Option<f64>,
    med: Option<f64>,
    p90: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
}

fn interpolate_rank(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn empty_histogram() -> Histogram<u64> {
    let mut hist = Histogram::new(HISTOGRAM_SIGFIG)
        .expect("3 significant digits is a valid histogram precision");
    hist.auto(true);
    hist
}

fn to_histogram(distribution: &Distribution) -> Histogram<u64> {
    match distribution {
        Distribution::Histogram(hist) => (**hist).clone(),
        Distribution::Exact(values) => {
            let mut hist = empty_histogram();
            for value in values.iter().filter(|v| **v >= 0.0) {
                let _ = hist.record((value * HISTOGRAM_SCALE).round() as u64);
            }
            hist
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend(storage: TrendStorage, values: &[f64]) -> TrendSnapshot {
        let sink = Sink::new("t", MetricKind::Trend, storage);
        for v in values {
            sink.ingest(MetricKind::Trend, *v).unwrap();
        }
        match sink.snapshot(Duration::from_secs(1)) {
            SinkSnapshot::Trend(t) => t,
            other => panic!("expected trend, got {:?}", other),
        }
    }

    #[test]
    fn test_counter_sums_and_rates() {
        let sink = Sink::new("c", MetricKind::Counter, TrendStorage::Exact);
        sink.ingest(MetricKind::Counter, 2.0).unwrap();
        sink.ingest(MetricKind::Counter, 3.0).unwrap();

        let SinkSnapshot::Counter(snap) = sink.snapshot(Duration::from_secs(10)) else {
            panic!("expected counter");
        };
        assert_eq!(snap.count, 5.0);
        assert_eq!(snap.samples, 2);
        assert!((snap.rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_counter_rejects_negative_increment() {
        let sink = Sink::new("c", MetricKind::Counter, TrendStorage::Exact);
        let err = sink.ingest(MetricKind::Counter, -1.0).unwrap_err();
        assert!(matches!(err, MetricError::NegativeIncrement { .. }));
    }

    #[test]
    fn test_rate_of_empty_sink_is_zero() {
        let sink = Sink::new("r", MetricKind::Rate, TrendStorage::Exact);
        let SinkSnapshot::Rate(snap) = sink.snapshot(Duration::ZERO) else {
            panic!("expected rate");
        };
        assert_eq!(snap.total, 0);
        assert_eq!(snap.rate, 0.0);
    }

    #[test]
    fn test_rate_counts_non_zero_as_success() {
        let sink = Sink::new("r", MetricKind::Rate, TrendStorage::Exact);
        for v in [1.0, 0.0, 1.0, 1.0] {
            sink.ingest(MetricKind::Rate, v).unwrap();
        }
        let SinkSnapshot::Rate(snap) = sink.snapshot(Duration::ZERO) else {
            panic!("expected rate");
        };
        assert_eq!(snap.successes, 3);
        assert_eq!(snap.failures(), 1);
        assert_eq!(snap.rate, 0.75);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let sink = Sink::new("r", MetricKind::Rate, TrendStorage::Exact);
        let err = sink.ingest(MetricKind::Trend, 1.0).unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                name: "r".into(),
                existing: MetricKind::Rate,
                attempted: MetricKind::Trend,
            }
        );
    }

    #[test]
    fn test_non_finite_values_rejected() {
        let sink = Sink::new("t", MetricKind::Trend, TrendStorage::Exact);
        assert!(sink.ingest(MetricKind::Trend, f64::NAN).is_err());
        assert!(sink.ingest(MetricKind::Trend, f64::INFINITY).is_err());
    }

    #[test]
    fn test_exact_percentiles_interpolate_between_ranks() {
        let snap = trend(TrendStorage::Exact, &[40.0, 10.0, 30.0, 20.0]);
        assert_eq!(snap.min(), Some(10.0));
        assert_eq!(snap.max(), Some(40.0));
        assert_eq!(snap.avg(), Some(25.0));
        assert_eq!(snap.med(), Some(25.0));
        // rank = 0.9 * 3 = 2.7 -> 30 + 0.7 * 10
        assert!((snap.percentile(90.0).unwrap() - 37.0).abs() < 1e-9);
        assert_eq!(snap.percentile(0.0), Some(10.0));
        assert_eq!(snap.percentile(100.0), Some(40.0));
    }

    #[test]
    fn test_single_sample_percentiles() {
        let snap = trend(TrendStorage::Exact, &[7.5]);
        assert_eq!(snap.percentile(95.0), Some(7.5));
        assert_eq!(snap.med(), Some(7.5));
    }

    #[test]
    fn test_empty_trend_has_no_statistics() {
        let snap = trend(TrendStorage::Exact, &[]);
        assert_eq!(snap.count(), 0);
        assert_eq!(snap.avg(), None);
        assert_eq!(snap.percentile(95.0), None);
    }

    #[test]
    fn test_histogram_percentiles_within_documented_error() {
        let values: Vec<f64> = (1..=1000).map(|v| v as f64).collect();
        let exact = trend(TrendStorage::Exact, &values);
        let approx = trend(TrendStorage::Histogram, &values);

        for p in [50.0, 90.0, 95.0, 99.0] {
            let e = exact.percentile(p).unwrap();
            let a = approx.percentile(p).unwrap();
            // nearest-rank vs interpolation differ by at most one rank here
            assert!((a - e).abs() <= e * 0.001 + 1.0, "p{}: {} vs {}", p, a, e);
        }
        assert_eq!(approx.percentile(0.0), Some(1.0));
        assert_eq!(approx.percentile(100.0), Some(1000.0));
    }

    #[test]
    fn test_histogram_rejects_negative_values() {
        let sink = Sink::new("t", MetricKind::Trend, TrendStorage::Histogram);
        let err = sink.ingest(MetricKind::Trend, -3.0).unwrap_err();
        assert!(matches!(err, MetricError::NegativeHistogramValue { .. }));
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        for storage in [TrendStorage::Exact, TrendStorage::Histogram] {
            let sink = Sink::new("t", MetricKind::Trend, storage);
            for v in [5.0, 1.0, 3.0] {
                sink.ingest(MetricKind::Trend, v).unwrap();
            }
            let first = sink.snapshot(Duration::from_secs(1));
            let second = sink.snapshot(Duration::from_secs(1));
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_merge_semantics() {
        let elapsed = Duration::from_secs(2);
        let a = SinkSnapshot::Rate(RateSnapshot::new(1, 4));
        let b = SinkSnapshot::Rate(RateSnapshot::new(3, 4));
        let SinkSnapshot::Rate(merged) = a.merge(&b, elapsed).unwrap() else {
            panic!("expected rate");
        };
        assert_eq!((merged.successes, merged.total), (4, 8));
        assert_eq!(merged.rate, 0.5);

        let a = SinkSnapshot::Trend(trend(TrendStorage::Exact, &[1.0, 9.0]));
        let b = SinkSnapshot::Trend(trend(TrendStorage::Exact, &[5.0]));
        let SinkSnapshot::Trend(merged) = a.merge(&b, elapsed).unwrap() else {
            panic!("expected trend");
        };
        assert_eq!(merged.count(), 3);
        assert_eq!(merged.med(), Some(5.0));
        assert_eq!(merged.avg(), Some(5.0));

        let counter = SinkSnapshot::Counter(CounterSnapshot::new(1.0, 1, elapsed));
        assert!(counter.merge(&b, elapsed).is_none());
    }

    #[test]
    fn test_unchanged_exact_trend_reuses_snapshot_values() {
        let sink = Sink::new("t", MetricKind::Trend, TrendStorage::Exact);
        for v in [5.0, 1.0, 3.0] {
            sink.ingest(MetricKind::Trend, v).unwrap();
        }
        let values = |snap: SinkSnapshot| match snap {
            SinkSnapshot::Trend(TrendSnapshot {
                distribution: Distribution::Exact(values),
                ..
            }) => values,
            other => panic!("expected exact trend, got {:?}", other),
        };

        let first = values(sink.snapshot(Duration::from_secs(1)));
        let second = values(sink.snapshot(Duration::from_secs(2)));
        assert!(Arc::ptr_eq(&first, &second));

        sink.ingest(MetricKind::Trend, 2.0).unwrap();
        let third = values(sink.snapshot(Duration::from_secs(3)));
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(&*third, &[1.0, 2.0, 3.0, 5.0]);
        assert_eq!(&*first, &[1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_merge_across_storages_drops_negative_samples() {
        let elapsed = Duration::from_secs(1);
        let exact = SinkSnapshot::Trend(trend(TrendStorage::Exact, &[-4.0, -1.0, 2.0, 6.0]));
        let histogram = SinkSnapshot::Trend(trend(TrendStorage::Histogram, &[10.0]));

        for (a, b) in [(&exact, &histogram), (&histogram, &exact)] {
            let SinkSnapshot::Trend(merged) = a.merge(b, elapsed).unwrap() else {
                panic!("expected trend");
            };
            assert_eq!(merged.count(), 3);
            assert_eq!(merged.min(), Some(2.0));
            assert_eq!(merged.max(), Some(10.0));
            assert_eq!(merged.avg(), Some(6.0));
            let Distribution::Histogram(hist) = &merged.distribution else {
                panic!("expected histogram");
            };
            assert_eq!(hist.len(), merged.count());
        }
    }

    #[test]
    fn test_trend_serializes_summary() {
        let snap = SinkSnapshot::Trend(trend(TrendStorage::Exact, &[1.0, 2.0, 3.0]));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["type"], "trend");
        assert_eq!(json["count"], 3);
        assert_eq!(json["med"], 2.0);
        assert_eq!(json["max"], 3.0);
    }
}
