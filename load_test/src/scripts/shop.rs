use async_trait::async_trait;
use crabswarm_core::{Iteration, IterationError, VuContext};
use serde_json::{json, Value};

use super::{between, chance, fetch, pick, think};

const SHOP_PAGES: &[&str] = &[
    "/shop/",
    "/product-category/clothing/",
    "/product-category/accessories/",
    "/product/flying-ninja/",
    "/product/happy-ninja/",
    "/product/ship-your-idea/",
];

pub fn options() -> Value {
    json!({
        "scenarios": {
            "shop_test": {
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
        "tags": { "project": "project_d" },
    })
}

/// Front page, one or two shop pages, and the cart 30% of the time.
pub struct Shop {
    base_url: String,
}

impl Shop {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

#[async_trait]
impl Iteration for Shop {
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

        for _ in 0..between(1, 2) {
            let page = pick(SHOP_PAGES);
            let res = fetch(ctx, &format!("{}{}", self.base_url, page)).await;
            let ok = ctx
                .check(&res)
                .that(&format!("{} status 200", page), |r| r.status == 200)
                .passed();
            ctx.rate("errors").add_bool(!ok);
            think(ctx, 1.0, 2.0).await;
        }

        if chance(0.3) {
            let cart = fetch(ctx, &format!("{}/cart/", self.base_url)).await;
            let ok = ctx
                .check(&cart)
                .that("cart page status 200", |r| r.status == 200)
                .passed();
            ctx.rate("errors").add_bool(!ok);
            think(ctx, 1.0, 1.0).await;
        }
        Ok(())
    }
}
