//! Executors - target concurrency over a scenario's timeline
//!
//! An executor only answers "how many VUs should be running `elapsed` into
//! this scenario". The scheduler owns the VUs and reconciles towards that
//! number on every tick.
//!
//! Between stage targets the count is interpolated linearly and moves away
//! from the previous target only once a whole VU of change has accumulated:
//! `from + trunc((to - from) * fraction)`. Ramp-ups therefore round down and
//! ramp-downs round up, and the curve never skips more than one VU at a
//! stage boundary.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutorKind {
    #[serde(rename = "ramping-vus")]
    RampingVus,
    #[serde(rename = "constant-vus")]
    ConstantVus,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::RampingVus => "ramping-vus",
            ExecutorKind::ConstantVus => "constant-vus",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ramping-vus" => Ok(ExecutorKind::RampingVus),
            "constant-vus" => Ok(ExecutorKind::ConstantVus),
            other => Err(other.to_string()),
        }
    }
}

/// One `{duration, target}` segment of a ramping timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Validated executor configuration of a scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorSpec {
    RampingVus {
        start_vus: u64,
        stages: Vec<Stage>,
        graceful_ramp_down: Duration,
    },
    ConstantVus {
        vus: u64,
        duration: Duration,
    },
}

impl ExecutorSpec {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutorSpec::RampingVus { .. } => ExecutorKind::RampingVus,
            ExecutorSpec::ConstantVus { .. } => ExecutorKind::ConstantVus,
        }
    }

    /// Timeline length, or `None` when the stages add up past `Duration::MAX`.
    pub fn checked_timeline(&self) -> Option<Duration> {
        match self {
            ExecutorSpec::RampingVus { stages, .. } => stages
                .iter()
                .try_fold(Duration::ZERO, |total, s| total.checked_add(s.duration)),
            ExecutorSpec::ConstantVus { duration, .. } => Some(*duration),
        }
    }

    pub fn build(&self) -> Box<dyn Executor> {
        match self {
            ExecutorSpec::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
            } => Box::new(RampingVus {
                start_vus: *start_vus,
                stages: stages.clone(),
                graceful_ramp_down: *graceful_ramp_down,
            }),
            ExecutorSpec::ConstantVus { vus, duration } => Box::new(ConstantVus {
                vus: *vus,
                duration: *duration,
            }),
        }
    }
}

pub trait Executor: Send + Sync + fmt::Debug {
    fn kind(&self) -> ExecutorKind;

    /// VUs that should be running `elapsed` after the scenario started.
    /// Zero once the timeline is over.
    fn desired_concurrency(&self, elapsed: Duration) -> u64;

    /// Total length of the timeline, excluding graceful stop
    fn timeline(&self) -> Duration;

    /// Highest concurrency the timeline ever asks for
    fn peak_vus(&self) -> u64;

    /// Grace period given to VUs removed while the timeline is still running
    fn graceful_ramp_down(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct RampingVus {
    start_vus: u64,
    stages: Vec<Stage>,
    graceful_ramp_down: Duration,
}

impl RampingVus {
    pub fn new(start_vus: u64, stages: Vec<Stage>, graceful_ramp_down: Duration) -> Self {
        Self {
            start_vus,
            stages,
            graceful_ramp_down,
        }
    }
}

impl Executor for RampingVus {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::RampingVus
    }

    fn desired_concurrency(&self, elapsed: Duration) -> u64 {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed < stage_end {
                return interpolate(from, stage.target, elapsed - stage_start, stage.duration);
            }
            from = stage.target;
            stage_start = stage_end;
        }
        0
    }

    fn timeline(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
    }

    fn peak_vus(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_vus, u64::max)
    }

    fn graceful_ramp_down(&self) -> Duration {
        self.graceful_ramp_down
    }
}

#[derive(Debug, Clone)]
pub struct ConstantVus {
    vus: u64,
    duration: Duration,
}

impl ConstantVus {
    pub fn new(vus: u64, duration: Duration) -> Self {
        Self { vus, duration }
    }
}

impl Executor for ConstantVus {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ConstantVus
    }

    fn desired_concurrency(&self, elapsed: Duration) -> u64 {
        if elapsed < self.duration {
            self.vus
        } else {
            0
        }
    }

    fn timeline(&self) -> Duration {
        self.duration
    }

    fn peak_vus(&self) -> u64 {
        self.vus
    }
}

fn interpolate(from: u64, to: u64, elapsed: Duration, span: Duration) -> u64 {
    if span.is_zero() || elapsed >= span {
        return to;
    }
    let fraction = elapsed.as_secs_f64() / span.as_secs_f64();
    let delta = (to as f64 - from as f64) * fraction;
    (from as f64 + delta.trunc()) as u64
}
