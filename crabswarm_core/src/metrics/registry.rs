//! Metric registry - lazily created sinks keyed by metric name
//!
//! Sub-metrics (`name{tag:value}`) are registered up front by thresholds, or
//! on the fly for per-check rates, and receive every sample of their parent
//! metric whose tags match the selector.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::sink::{Sink, SinkSnapshot, TrendStorage};
use super::types::{builtin, MetricKey, MetricKind, MetricSample};
use crate::error::MetricError;

/// Snapshots of every sink, keyed by rendered metric key.
pub type Snapshots = BTreeMap<String, SinkSnapshot>;

pub struct MetricRegistry {
    storage: TrendStorage,
    sinks: RwLock<BTreeMap<String, Arc<Sink>>>,
    submetrics: RwLock<HashMap<String, Vec<SubMetric>>>,
    /// Sub-metrics whose parent has not been seen yet, by parent name
    declared: RwLock<HashMap<String, Vec<MetricKey>>>,
}

struct SubMetric {
    key: MetricKey,
    sink: Arc<Sink>,
}

impl MetricRegistry {
    pub fn new(storage: TrendStorage) -> Self {
        Self {
            storage,
            sinks: RwLock::new(BTreeMap::new()),
            submetrics: RwLock::new(HashMap::new()),
            declared: RwLock::new(HashMap::new()),
        }
    }

    /// Make sure a sub-metric sink exists for `key` so it sees every matching sample.
    ///
    /// The kind is taken from the parent metric when it already exists.
    pub fn register_submetric(&self, key: &MetricKey, kind: MetricKind) -> Arc<Sink> {
        let rendered = key.to_string();
        if let Some(sink) = self.sinks.read().get(&rendered) {
            return sink.clone();
        }

        let mut sinks = self.sinks.write();
        if let Some(sink) = sinks.get(&rendered) {
            return sink.clone();
        }
        let kind = sinks.get(&key.name).map(|s| s.kind()).unwrap_or(kind);
        let sink = Arc::new(Sink::new(rendered.clone(), kind, self.storage));
        sinks.insert(rendered, sink.clone());
        self.submetrics
            .write()
            .entry(key.name.clone())
            .or_default()
            .push(SubMetric {
                key: key.clone(),
                sink: sink.clone(),
            });
        sink
    }

    /// Like [`register_submetric`](Self::register_submetric) for metrics of
    /// unknown kind: the sink is created with the parent's kind as soon as
    /// the parent exists.
    pub fn declare_submetric(&self, key: &MetricKey) {
        if let Some(kind) = self.kind_of(&key.name) {
            self.register_submetric(key, kind);
            return;
        }
        self.declared
            .write()
            .entry(key.name.clone())
            .or_default()
            .push(key.clone());
    }

    pub fn ingest(&self, sample: &MetricSample) -> Result<(), MetricError> {
        let sink = self.sink_for(&sample.metric, sample.kind);
        sink.ingest(sample.kind, sample.value)?;

        if sample.metric == builtin::CHECKS {
            if let Some(check) = sample.tags.get("check") {
                let mut selector = BTreeMap::new();
                selector.insert("check".to_string(), check.clone());
                let key = MetricKey {
                    name: builtin::CHECKS.to_string(),
                    selector,
                };
                self.register_submetric(&key, MetricKind::Rate);
            }
        }

        if let Some(subs) = self.submetrics.read().get(&sample.metric) {
            for sub in subs.iter().filter(|s| s.key.matches(&sample.tags)) {
                sub.sink.ingest(sample.kind, sample.value)?;
            }
        }
        Ok(())
    }

    pub fn kind_of(&self, key: &str) -> Option<MetricKind> {
        self.sinks.read().get(key).map(|s| s.kind())
    }

    pub fn snapshot_of(&self, key: &str, elapsed: Duration) -> Option<SinkSnapshot> {
        let sink = self.sinks.read().get(key).cloned()?;
        Some(sink.snapshot(elapsed))
    }

    /// Snapshot every sink. Each sink is internally consistent; samples that
    /// land while the map is walked may show up in some sinks and not others.
    pub fn snapshot(&self, elapsed: Duration) -> Snapshots {
        let sinks: Vec<(String, Arc<Sink>)> = self
            .sinks
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        sinks
            .into_iter()
            .map(|(key, sink)| (key, sink.snapshot(elapsed)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sink_for(&self, name: &str, kind: MetricKind) -> Arc<Sink> {
        if let Some(sink) = self.sinks.read().get(name) {
            return sink.clone();
        }
        let sink = self
            .sinks
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating {} metric '{}'", kind, name);
                Arc::new(Sink::new(name, kind, self.storage))
            })
            .clone();

        let declared = self.declared.write().remove(name);
        for key in declared.into_iter().flatten() {
            self.register_submetric(&key, sink.kind());
        }
        sink
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new(TrendStorage::default())
    }
}
