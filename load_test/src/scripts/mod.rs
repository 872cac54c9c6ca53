//! Built-in load test scripts.
//!
//! Each script is an [`Iteration`] plus the options document it is meant to
//! run with. All of them browse the public k6 demo site by default.

mod homepage;
mod navigation;
mod search;
mod shop;

use std::time::Duration;

use clap::ValueEnum;
use crabswarm_core::vu::DEFAULT_EXEC;
use crabswarm_core::{HttpResponse, IterationRegistry, VuContext};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

pub use homepage::Homepage;
pub use navigation::Navigation;
pub use search::Search;
pub use shop::Shop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Script {
    /// Front page and news, ramping to 10 VUs
    Homepage,
    /// Front page then 1-3 random pages
    Navigation,
    /// Random searches under constant load, followed by a spike
    Search,
    /// Shop pages and the cart
    Shop,
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Script::Homepage => "homepage",
            Script::Navigation => "navigation",
            Script::Search => "search",
            Script::Shop => "shop",
        }
    }

    /// Options document the script ships with
    pub fn default_options(&self) -> Value {
        match self {
            Script::Homepage => homepage::options(),
            Script::Navigation => navigation::options(),
            Script::Search => search::options(),
            Script::Shop => shop::options(),
        }
    }

    /// Registers the script's iteration as the default exec
    pub fn register(&self, iterations: &mut IterationRegistry, base_url: &str) {
        let base_url = base_url.trim_end_matches('/').to_string();
        match self {
            Script::Homepage => iterations.register(DEFAULT_EXEC, Homepage::new(base_url)),
            Script::Navigation => iterations.register(DEFAULT_EXEC, Navigation::new(base_url)),
            Script::Search => iterations.register(DEFAULT_EXEC, Search::new(base_url)),
            Script::Shop => iterations.register(DEFAULT_EXEC, Shop::new(base_url)),
        }
    }
}

/// GETs `url`. A transport failure comes back as a status 0 response so the
/// script's checks fail instead of the iteration.
pub(crate) async fn fetch(ctx: &mut VuContext, url: &str) -> HttpResponse {
    ctx.get(url).await.unwrap_or_else(|_| HttpResponse {
        status: 0,
        body: String::new(),
        duration: Duration::ZERO,
    })
}

/// Sleeps for a uniformly random time in `[min, min + spread)` seconds
pub(crate) async fn think(ctx: &VuContext, min: f64, spread: f64) {
    let secs = min + rand::random::<f64>() * spread;
    ctx.sleep(Duration::from_secs_f64(secs)).await;
}

pub(crate) fn pick<'a>(items: &[&'a str]) -> &'a str {
    items
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or_default()
}

/// Uniform integer in `[low, high]`
pub(crate) fn between(low: u32, high: u32) -> u32 {
    rand::thread_rng().gen_range(low..=high)
}

pub(crate) fn chance(p: f64) -> bool {
    rand::random::<f64>() < p
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crabswarm_core::{IterationRegistry, RunConfig, RunOptions, RunResult};
    use crabswarm_testsuite::{MockHttpClient, TestRun};
    use serde_json::Value;

    use super::Script;

    /// Body that satisfies every content check the scripts make
    pub const DEMO_BODY: &str = "<h1>Welcome to the k6.io demo site!</h1> \
        <h2>Latest News</h2> <p>Search results for</p>";

    /// Runs `script` with `options` against `http`; call under paused time
    pub async fn run_script(script: Script, options: Value, http: Arc<MockHttpClient>) -> RunResult {
        let config = RunConfig::from_options(RunOptions::from_value(options).unwrap()).unwrap();
        let mut iterations = IterationRegistry::new();
        script.register(&mut iterations, "http://demo.local/");
        TestRun::new(config)
            .with_http(http)
            .with_iterations(iterations)
            .run()
            .await
            .unwrap()
    }
}
