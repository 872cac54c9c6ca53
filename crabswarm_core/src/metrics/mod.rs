//! Metrics pipeline: sample types, sinks, the registry and the collector task.

pub mod collector;
pub mod registry;
pub mod sink;
pub mod types;

pub use collector::{CollectorStats, MetricsCollector, SampleSender};
pub use registry::{MetricRegistry, Snapshots};
pub use sink::{CounterSnapshot, RateSnapshot, Sink, SinkSnapshot, TrendSnapshot, TrendStorage};
pub use types::{builtin, MetricKey, MetricKind, MetricSample, Tags};
