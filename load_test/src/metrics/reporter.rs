//! Console reporter: live progress while the run is going and the final
//! summary once it is over

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use crabswarm_core::config::format_duration;
use crabswarm_core::metrics::builtin;
use crabswarm_core::{
    AbortReason, MetricRegistry, Outcome, Progress, RunResult, RunStatus, SinkSnapshot,
};
use tokio::sync::watch;
use tokio::time::interval;

use super::system::{SystemMonitor, SystemStats};

/// Print live progress every `every` until the engine goes away
pub async fn start_periodic_reporter(
    mut progress: watch::Receiver<Progress>,
    registry: Arc<MetricRegistry>,
    every: Duration,
) {
    let monitor = SystemMonitor::new();
    let mut ticker = interval(every);
    // the first tick completes immediately, before anything has run
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if progress.has_changed().is_err() {
            break;
        }
        let snapshot = progress.borrow_and_update().clone();
        let view = LiveView {
            progress: &snapshot,
            registry: &registry,
            system: monitor.sample(),
        };

        // Clear screen and move cursor to top
        print!("\x1B[2J\x1B[1;1H{}", view);
        let _ = io::stdout().flush();
    }
}

pub fn print_final_report(result: &RunResult) {
    println!("{}", FinalReport(result));
}

pub struct LiveView<'a> {
    pub progress: &'a Progress,
    pub registry: &'a MetricRegistry,
    pub system: SystemStats,
}

impl fmt::Display for LiveView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.progress.elapsed;
        let secs = elapsed.as_secs();
        let snapshot = |key: &str| self.registry.snapshot_of(key, elapsed);

        writeln!(f, "╔════════════════════════════════════════════════════════════════╗")?;
        writeln!(f, "║             crabswarm load test - live progress                ║")?;
        writeln!(f, "╚════════════════════════════════════════════════════════════════╝")?;
        writeln!(
            f,
            "\n⏱️  Elapsed Time: {:02}:{:02}:{:02}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )?;

        writeln!(f, "\n┌─ SCENARIOS ─────────────────────────────────────────────────┐")?;
        for (name, state) in &self.progress.scenarios {
            writeln!(f, "│  {:<28} {:>10}", name, state.to_string())?;
        }
        writeln!(
            f,
            "│  VUs: {:>6} active  {:>6} live",
            self.progress.active_vus, self.progress.live_vus
        )?;
        writeln!(f, "└─────────────────────────────────────────────────────────────┘")?;

        writeln!(f, "\n┌─ REQUESTS ──────────────────────────────────────────────────┐")?;
        if let Some(SinkSnapshot::Counter(reqs)) = snapshot(builtin::HTTP_REQS) {
            writeln!(f, "│  Requests:   {:>10}    Throughput: {:>8.2}/sec", reqs.count, reqs.rate)?;
        }
        if let Some(SinkSnapshot::Rate(failed)) = snapshot(builtin::HTTP_REQ_FAILED) {
            writeln!(f, "│  Failed:     {:>9.2}%    ({} of {})", failed.rate * 100.0, failed.successes, failed.total)?;
        }
        if let Some(SinkSnapshot::Trend(latency)) = snapshot(builtin::HTTP_REQ_DURATION) {
            writeln!(
                f,
                "│  Latency ms  P50: {:>8.2}  P95: {:>8.2}  Max: {:>8.2}",
                latency.med().unwrap_or_default(),
                latency.percentile(95.0).unwrap_or_default(),
                latency.max().unwrap_or_default()
            )?;
        }
        if let Some(SinkSnapshot::Counter(iterations)) = snapshot(builtin::ITERATIONS) {
            writeln!(f, "│  Iterations: {:>10}", iterations.count)?;
        }
        if let Some(SinkSnapshot::Rate(checks)) = snapshot(builtin::CHECKS) {
            writeln!(f, "│  Checks:     {:>9.2}%", checks.rate * 100.0)?;
        }
        writeln!(f, "└─────────────────────────────────────────────────────────────┘")?;

        if !self.progress.thresholds.is_empty() {
            writeln!(f, "\n┌─ THRESHOLDS ────────────────────────────────────────────────┐")?;
            for (rule, outcome) in &self.progress.thresholds {
                writeln!(f, "│  {} {}", mark(*outcome), rule)?;
            }
            writeln!(f, "└─────────────────────────────────────────────────────────────┘")?;
        }

        writeln!(f, "\n┌─ SYSTEM ────────────────────────────────────────────────────┐")?;
        writeln!(
            f,
            "│  CPU Usage:    {:>6.1}%    Memory: {:>6} / {:>6} MB",
            self.system.cpu_usage, self.system.memory_used_mb, self.system.memory_total_mb
        )?;
        writeln!(f, "└─────────────────────────────────────────────────────────────┘")?;

        writeln!(f, "\n  [Press Ctrl+C to stop test]")
    }
}

pub struct FinalReport<'a>(pub &'a RunResult);

impl fmt::Display for FinalReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = self.0;

        writeln!(f, "\n╔════════════════════════════════════════════════════════════════╗")?;
        writeln!(f, "║                    FINAL TEST REPORT                           ║")?;
        writeln!(f, "╚════════════════════════════════════════════════════════════════╝")?;
        writeln!(f, "\n   Run:      {}", result.run_id)?;
        writeln!(f, "   Started:  {}", result.started_at.to_rfc3339())?;
        writeln!(f, "   Duration: {}", format_duration(result.elapsed))?;

        writeln!(f, "\n🧭 SCENARIOS")?;
        for s in &result.scenarios {
            writeln!(
                f,
                "   {:<20} {:<13} {:<10} vus {:>4} (peak {:>4})  iterations {:>7}  faults {:>5}  interrupted {:>4}",
                s.name,
                s.executor.to_string(),
                s.state.to_string(),
                s.vus_started,
                s.peak_vus,
                s.iterations,
                s.faults,
                s.interrupted
            )?;
        }

        writeln!(f, "\n📈 METRICS")?;
        for (key, snapshot) in &result.metrics {
            let label = if key.contains('{') {
                format!("  {}", key)
            } else {
                key.clone()
            };
            writeln!(f, "   {:<44} {}", label, describe(snapshot))?;
        }

        if !result.thresholds.is_empty() {
            writeln!(f, "\n🎯 THRESHOLDS")?;
            for t in &result.thresholds {
                match t.observed {
                    Some(observed) => {
                        writeln!(f, "   {} {:<44} observed {:.2}", mark(t.outcome), t.rule, observed)?
                    }
                    None => writeln!(f, "   {} {:<44} no samples", mark(t.outcome), t.rule)?,
                }
            }
        }

        writeln!(f, "\n   Status: {} (exit code {})", status_line(&result.status), result.exit_code())?;
        if result.collector.rejected > 0 {
            writeln!(f, "   {} samples were rejected", result.collector.rejected)?;
        }
        write!(f, "════════════════════════════════════════════════════════════════")
    }
}

fn describe(snapshot: &SinkSnapshot) -> String {
    match snapshot {
        SinkSnapshot::Counter(c) => format!("{:.0}  {:.2}/s", c.count, c.rate),
        SinkSnapshot::Rate(r) => format!(
            "{:.2}%  ✓ {}  ✗ {}",
            r.rate * 100.0,
            r.successes,
            r.failures()
        ),
        SinkSnapshot::Trend(t) => format!(
            "avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2}",
            t.avg().unwrap_or_default(),
            t.min().unwrap_or_default(),
            t.med().unwrap_or_default(),
            t.max().unwrap_or_default(),
            t.percentile(90.0).unwrap_or_default(),
            t.percentile(95.0).unwrap_or_default()
        ),
    }
}

fn mark(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pass => "✓",
        Outcome::Fail => "✗",
        Outcome::Inconclusive => "?",
    }
}

fn status_line(status: &RunStatus) -> String {
    match status {
        RunStatus::Passed => "PASSED".to_string(),
        RunStatus::ThresholdsFailed => "THRESHOLDS FAILED".to_string(),
        RunStatus::Aborted(AbortReason::Signal) => "ABORTED (interrupted)".to_string(),
        RunStatus::Aborted(AbortReason::Deadline) => "ABORTED (deadline reached)".to_string(),
        RunStatus::Aborted(AbortReason::Threshold { rule }) => {
            format!("ABORTED (threshold '{}' failed)", rule)
        }
    }
}
