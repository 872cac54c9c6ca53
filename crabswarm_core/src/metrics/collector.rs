//! Metrics collector - channel handoff from VUs into the registry
//!
//! VUs never touch the registry directly. Each finished iteration sends its
//! buffered samples as one batch; a single collector task drains the channel
//! into the sinks. The collector finishes once every sender is dropped, which
//! the engine uses as its "all telemetry is in" barrier.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::MetricRegistry;
use super::types::MetricSample;

/// Cloneable handle VUs use to hand off telemetry.
#[derive(Clone, Debug)]
pub struct SampleSender {
    tx: mpsc::UnboundedSender<Vec<MetricSample>>,
}

impl SampleSender {
    /// Never blocks; a batch sent after the collector stopped is dropped.
    pub fn send(&self, batch: Vec<MetricSample>) {
        if batch.is_empty() {
            return;
        }
        if self.tx.send(batch).is_err() {
            tracing::warn!("Telemetry collector is gone, dropping sample batch");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub batches: u64,
    pub ingested: u64,
    pub rejected: u64,
}

pub struct MetricsCollector {
    registry: Arc<MetricRegistry>,
    rx: mpsc::UnboundedReceiver<Vec<MetricSample>>,
}

impl MetricsCollector {
    pub fn new(registry: Arc<MetricRegistry>) -> (SampleSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SampleSender { tx }, Self { registry, rx })
    }

    /// Drain batches until every sender is dropped.
    pub async fn run(mut self) -> CollectorStats {
        let mut stats = CollectorStats::default();
        while let Some(batch) = self.rx.recv().await {
            stats.batches += 1;
            for sample in &batch {
                match self.registry.ingest(sample) {
                    Ok(()) => stats.ingested += 1,
                    Err(e) => {
                        stats.rejected += 1;
                        tracing::warn!("Rejected sample: {}", e);
                    }
                }
            }
        }
        tracing::debug!(
            "Collector drained {} batches ({} samples, {} rejected)",
            stats.batches,
            stats.ingested,
            stats.rejected
        );
        stats
    }

    pub fn spawn(registry: Arc<MetricRegistry>) -> (SampleSender, JoinHandle<CollectorStats>) {
        let (sender, collector) = Self::new(registry);
        (sender, tokio::spawn(collector.run()))
    }
}
