use async_trait::async_trait;
use crabswarm_core::{Iteration, IterationError, VuContext};
use serde_json::{json, Value};

use super::{between, chance, fetch, pick, think};

const TERMS: &[&str] = &[
    "test",
    "k6",
    "load",
    "testing",
    "performance",
    "api",
    "http",
    "metrics",
    "dashboard",
    "report",
];

const PAGES: &[&str] = &["/about", "/contact", "/documentation", "/pricing", "/features"];

/// Five constant users for a minute, then a 10 user spike
pub fn options() -> Value {
    json!({
        "scenarios": {
            "search_load": {
                "executor": "constant-vus",
                "vus": 5,
                "duration": "1m",
                "gracefulStop": "10s",
            },
            "spike_test": {
                "executor": "ramping-vus",
                "startVUs": 0,
                "stages": [
                    { "duration": "30s", "target": 10 },
                    { "duration": "20s", "target": 10 },
                    { "duration": "10s", "target": 0 },
                ],
                "startTime": "1m",
                "gracefulStop": "10s",
            },
        },
        "thresholds": {
            "search_duration": ["p(95)<1000", "p(99)<2000"],
            "http_req_duration": ["p(95)<1500"],
            "http_req_failed": ["rate<0.1"],
        },
        "tags": { "project": "project_c" },
    })
}

/// Random search, think time, and a static page 30% of the time.
pub struct Search {
    base_url: String,
}

impl Search {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }

    fn search_url(&self) -> String {
        format!("{}/?s={}&page={}", self.base_url, pick(TERMS), between(1, 3))
    }
}

fn has_results(body: &str) -> bool {
    ["Search results for", "No results found", "Page not found"]
        .iter()
        .any(|marker| body.contains(marker))
}

#[async_trait]
impl Iteration for Search {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        let url = self.search_url();
        let res = fetch(ctx, &url).await;
        ctx.trend("search_duration")
            .add(res.duration.as_secs_f64() * 1000.0);

        let ok = ctx
            .check(&res)
            .that("search status 200", |r| r.status == 200)
            .that("has search results", |r| has_results(&r.body))
            .passed();
        ctx.rate("errors").add_bool(!ok);

        think(ctx, 1.0, 2.0).await;

        if chance(0.3) {
            let page = pick(PAGES);
            let res = fetch(ctx, &format!("{}{}", self.base_url, page)).await;
            let ok = ctx
                .check(&res)
                .that("page status 200", |r| r.status == 200)
                .passed();
            ctx.rate("errors").add_bool(!ok);
            think(ctx, 0.5, 1.0).await;
        }
        Ok(())
    }
}
