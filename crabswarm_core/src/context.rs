//! Per-run state shared by the scheduler and every VU it spawns.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::SharedClock;
use crate::http::HttpClient;
use crate::metrics::{SampleSender, Tags};

/// Created at run start, dropped at run end. Nothing in here is global, so
/// several runs can live in one process.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub clock: SharedClock,
    pub http: Arc<dyn HttpClient>,
    pub samples: SampleSender,
    /// Run-level tags attached to every sample
    pub tags: Arc<Tags>,
}

impl RunContext {
    pub fn new(
        clock: SharedClock,
        http: Arc<dyn HttpClient>,
        samples: SampleSender,
        tags: Tags,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            clock,
            http,
            samples,
            tags: Arc::new(tags),
        }
    }
}
