use async_trait::async_trait;
use crabswarm_core::{Iteration, IterationError, VuContext};
use serde_json::{json, Value};

use super::{chance, fetch, think};

/// Ramp to 5 then 10 users over 30s, then back down
pub fn options() -> Value {
    json!({
        "stages": [
            { "duration": "10s", "target": 5 },
            { "duration": "20s", "target": 10 },
            { "duration": "10s", "target": 0 },
        ],
        "thresholds": {
            "http_req_duration": ["p(95)<1000"],
            "http_req_failed": ["rate<0.1"],
        },
        "tags": { "project": "project_a" },
    })
}

/// Loads the front page, and the news page half of the time.
pub struct Homepage {
    base_url: String,
}

impl Homepage {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

#[async_trait]
impl Iteration for Homepage {
    async fn run(&self, ctx: &mut VuContext) -> Result<(), IterationError> {
        let main = fetch(ctx, &format!("{}/", self.base_url)).await;
        let ok = ctx
            .check(&main)
            .that("main page status 200", |r| r.status == 200)
            .that("has welcome text", |r| {
                r.body.contains("Welcome to the k6.io demo site!")
            })
            .passed();
        ctx.rate("errors").add_bool(!ok);

        think(ctx, 0.0, 2.0).await;

        if chance(0.5) {
            let news = fetch(ctx, &format!("{}/news.php", self.base_url)).await;
            let ok = ctx
                .check(&news)
                .that("news page status 200", |r| r.status == 200)
                .that("has news content", |r| r.body.contains("Latest News"))
                .passed();
            ctx.rate("errors").add_bool(!ok);
            think(ctx, 1.0, 0.0).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crabswarm_core::RunStatus;
    use crabswarm_testsuite::{rate, MockHttpClient};

    use super::*;
    use crate::scripts::testing::{run_script, DEMO_BODY};
    use crate::scripts::Script;

    #[tokio::test(start_paused = true)]
    async fn builtin_ramp_passes_against_a_healthy_site() {
        let http = Arc::new(MockHttpClient::new().with_body(DEMO_BODY));
        let result = run_script(Script::Homepage, options(), http.clone()).await;

        assert_eq!(result.status, RunStatus::Passed);
        assert_eq!(rate(&result, "checks").unwrap().rate, 1.0);
        assert_eq!(rate(&result, "errors").unwrap().rate, 0.0);
        assert!(rate(&result, "checks{check:has welcome text}").is_some());
        assert!(http
            .requested_urls()
            .iter()
            .all(|url| url == "http://demo.local/" || url == "http://demo.local/news.php"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_welcome_text_fails_only_that_check() {
        let http = Arc::new(MockHttpClient::new().with_body("<h1>maintenance</h1>"));
        let opts = json!({ "vus": 2, "duration": "10s" });
        let result = run_script(Script::Homepage, opts, http).await;

        assert_eq!(rate(&result, "checks{check:main page status 200}").unwrap().rate, 1.0);
        assert_eq!(rate(&result, "checks{check:has welcome text}").unwrap().rate, 0.0);
        assert_eq!(rate(&result, "errors").unwrap().rate, 1.0);
    }
}
