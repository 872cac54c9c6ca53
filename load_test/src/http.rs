//! reqwest-backed request primitive

use std::time::Duration;

use async_trait::async_trait;
use crabswarm_core::{HttpClient, HttpResponse, Method, TransportError};
use tokio::time::Instant;

pub struct ReqwestClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crabswarm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, url: &str, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_builder() {
            TransportError::InvalidUrl(url.to_string())
        } else if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, method: Method, url: &str) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let response = self
            .client
            .request(to_reqwest(method), url)
            .send()
            .await
            .map_err(|e| self.map_error(url, e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.map_error(url, e))?;
        tracing::debug!("{} {} -> {}", method, url, status);

        Ok(HttpResponse {
            status,
            body,
            duration: started.elapsed(),
        })
    }
}
