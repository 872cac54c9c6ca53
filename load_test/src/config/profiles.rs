use clap::ValueEnum;
use serde_json::{json, Map, Value};

/// Named tuning presets for the engine's run-level options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    Smoke,
    Default,
    Soak,
}

impl Profile {
    /// Run-level options this profile contributes
    pub fn options(&self) -> Map<String, Value> {
        let value = match self {
            Profile::Smoke => smoke_profile(),
            Profile::Default => default_profile(),
            Profile::Soak => soak_profile(),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Fills the options the document leaves unset. Explicit options win.
    pub fn apply(&self, options: &mut Value) {
        let Value::Object(target) = options else {
            return;
        };
        for (key, value) in self.options() {
            target.entry(key).or_insert(value);
        }
    }
}

/// Smoke profile for checking a script end to end
///
/// - 50ms ticks so short ramps track closely
/// - thresholds evaluated every second
/// - hard 2 minute deadline
fn smoke_profile() -> Value {
    json!({
        "tickInterval": "50ms",
        "thresholdInterval": "1s",
        "deadline": "2m",
    })
}

/// Default profile: the engine's own defaults
fn default_profile() -> Value {
    json!({
        "tickInterval": "100ms",
        "thresholdInterval": "2s",
    })
}

/// Soak profile for long runs
///
/// - coarser 250ms ticks
/// - thresholds evaluated every 10 seconds
/// - trends kept in HDR histograms so memory stays bounded
fn soak_profile() -> Value {
    json!({
        "tickInterval": "250ms",
        "thresholdInterval": "10s",
        "trendStorage": "histogram",
    })
}
