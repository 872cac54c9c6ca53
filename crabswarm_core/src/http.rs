//! The request primitive iterations use.
//!
//! The engine never speaks HTTP itself; it only needs something that turns a
//! method and URL into a status, body and duration.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Time spent on the round trip, as measured by the transport
    pub duration: Duration,
}

impl HttpResponse {
    /// Statuses 200-399 count as success for `http_req_failed`.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, method: Method, url: &str) -> Result<HttpResponse, TransportError>;
}
