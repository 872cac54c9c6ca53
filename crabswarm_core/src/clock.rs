//! Monotonic time sources.
//!
//! Every scheduling decision is an offset from the moment the run started.
//! [`TokioClock`] reads `tokio::time::Instant`, so runs under
//! `tokio::time::pause()` are deterministic. [`ManualClock`] only moves when a
//! test advances it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Source of "time since run start".
pub trait Clock: Send + Sync + fmt::Debug {
    fn elapsed(&self) -> Duration;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Test clock that is advanced by hand.
///
/// Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: Duration) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.now.lock()
    }
}
