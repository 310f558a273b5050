//! HTTP seam between the engine and the partner API.
//!
//! The gateway and token manager only see `PartnerTransport`, so the
//! orchestrator can be exercised against scripted responses. The real
//! implementation wraps a blocking `reqwest` client; it is `Send + Sync`
//! and shared across workers via `Arc`.

use crate::error::{EnrichError, EnrichResult};
use std::time::Duration;

/// Status and body of a completed HTTP exchange, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body:   String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Ordered header pairs sent with a request.
pub type Headers = Vec<(String, String)>;

pub trait PartnerTransport: Send + Sync {
    /// GET `url`. Errors only for transport faults (DNS, reset, timeout);
    /// any HTTP status comes back as `Ok`.
    fn get(&self, url: &str, headers: &Headers) -> EnrichResult<RawResponse>;

    /// POST a JSON body to `url`. Same error contract as `get`.
    fn post_json(&self, url: &str, body: &serde_json::Value) -> EnrichResult<RawResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> EnrichResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn finish(
        url: &str,
        sent: reqwest::Result<reqwest::blocking::Response>,
    ) -> EnrichResult<RawResponse> {
        let resp = sent.map_err(|e| transport_error(url, e))?;
        let status = resp.status().as_u16();
        let body = resp.text().map_err(|e| transport_error(url, e))?;
        Ok(RawResponse { status, body })
    }
}

fn transport_error(url: &str, e: reqwest::Error) -> EnrichError {
    let reason = if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    EnrichError::Transport { url: url.to_string(), reason }
}

impl PartnerTransport for HttpTransport {
    fn get(&self, url: &str, headers: &Headers) -> EnrichResult<RawResponse> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        Self::finish(url, req.send())
    }

    fn post_json(&self, url: &str, body: &serde_json::Value) -> EnrichResult<RawResponse> {
        Self::finish(url, self.client.post(url).json(body).send())
    }
}
