//! Upstream page source.
//!
//! [`PageSource`] is the only seam between the engine and the network. The
//! `reqwest` implementation applies a per-request timeout and bounded retry
//! with exponential backoff, and sorts failures into chunk-level
//! [`PageError`]s and partition-fatal [`TransportError`]s.

use crate::error::{PageError, RequestError, TransportError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ERROR_BODY_CHARS: usize = 200;

/// One GET request: a URL plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Full URL with the query string encoded.
    pub fn to_url(&self) -> Result<Url, TransportError> {
        let parsed = if self.query.is_empty() {
            Url::parse(&self.url)
        } else {
            Url::parse_with_params(&self.url, &self.query)
        };
        parsed.map_err(|e| TransportError::InvalidRequest(format!("{}: {}", self.url, e)))
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Fetches one JSON page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, request: &PageRequest) -> Result<Value, RequestError>;
}

/// Timeout and retry policy for HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl HttpConfig {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }
}

/// `reqwest`-backed page source.
#[derive(Debug, Clone)]
pub struct ReqwestPageSource {
    client: Client,
    config: HttpConfig,
}

impl ReqwestPageSource {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("ebbflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                TransportError::InvalidRequest(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut short: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    short.push_str("...");
    short
}

#[async_trait]
impl PageSource for ReqwestPageSource {
    async fn get(&self, request: &PageRequest) -> Result<Value, RequestError> {
        let url = request.to_url()?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("GET {} (attempt {}/{})", url, attempt, max_attempts);

            let response = match self.client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(err) if err.is_builder() => {
                    return Err(TransportError::InvalidRequest(err.to_string()).into());
                }
                Err(err) => {
                    if attempt < max_attempts {
                        let delay = self.config.backoff_delay(attempt);
                        warn!("Request to {} failed: {}; retrying in {:?}", url, err, delay);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(TransportError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    }
                    .into());
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(TransportError::Unauthorized {
                    status: status.as_u16(),
                    url: url.to_string(),
                }
                .into());
            }

            if !status.is_success() {
                if is_retryable_status(status) && attempt < max_attempts {
                    let delay = self.config.backoff_delay(attempt);
                    warn!("HTTP {} from {}; retrying in {:?}", status, url, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                let body = response.text().await.unwrap_or_default();
                return Err(PageError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body: truncate_body(&body),
                }
                .into());
            }

            let body = response.text().await.map_err(|e| PageError::Malformed {
                url: url.to_string(),
                reason: format!("failed to read body: {}", e),
            })?;
            return serde_json::from_str(&body).map_err(|e| {
                PageError::Malformed {
                    url: url.to_string(),
                    reason: format!("body is not JSON: {}", e),
                }
                .into()
            });
        }
    }
}
