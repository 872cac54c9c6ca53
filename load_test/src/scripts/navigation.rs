use async_trait::async_trait;
use crabswarm_core::{Iteration, IterationError, VuContext};
use serde_json::{json, Value};

use super::{between, fetch, pick, think};

const PAGES: &[&str] = &[
    "/about",
    "/contact",
    "/documentation",
    "/pricing",
    "/features",
    "/news.php",
];

pub fn options() -> Value {
    json!({
        "scenarios": {
            "navigation_test": {
                "executor": "ramping-vus",
                "startVUs": 1,
                "stages": [
                    { "duration": "5s", "target": 2 },
                    { "duration": "10s", "target": 3 },
                    { "duration": "5s", "target": 0 },
                ],
                "gracefulRampDown": "5s",
            },
        },
        "thresholds": {
            "http_req_duration": ["p(95)<2000"],
            "http_req_failed": ["rate<0.3"],
        },
        "tags": { "project": "project_b" },
    })
}

/// Front page, then one to three random pages with think time between them.
/// Stops early when the front page is down.
pub struct Navigation {
    base_url: String,
}

impl Navigation {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

#[async_trait]
impl Iteration for Navigation {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        let main = fetch(ctx, &self.base_url).await;
        let ok = ctx
            .check(&main)
            .that("main page status 200", |r| r.status == 200)
            .passed();
        ctx.rate("errors").add_bool(!ok);
        if !ok {
            return Ok(());
        }
        ctx.counter("page_load_success").add(1.0);

        for _ in 0..between(1, 3) {
            let page = pick(PAGES);
            let res = fetch(ctx, &format!("{}{}", self.base_url, page)).await;
            let ok = ctx
                .check(&res)
                .that(&format!("{} status 200", page), |r| r.status == 200)
                .passed();
            ctx.rate("errors").add_bool(!ok);
            think(ctx, 1.0, 2.0).await;
        }
        Ok(())
    }
}
