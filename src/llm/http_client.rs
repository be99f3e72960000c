// src/llm/http_client.rs
// Shared HTTP client for all providers: retry, backoff, auth classification

use rand::Rng;
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Maximum attempts against a single provider
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff, doubled each attempt
const BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Request timeout for non-streaming calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Wall-clock ceiling for streaming responses
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome classification the router needs: auth failures stop the whole
/// dispatch, exhausted retries trigger fallback.
#[derive(Error, Debug)]
pub enum LlmHttpError {
    /// Provider rejected the key: never retried, never falls back
    #[error("provider rejected credentials (status {status})")]
    AuthRejected { status: u16 },

    /// Retries exhausted on 429/5xx
    #[error("provider error after {attempts} attempts (status {status}): {body}")]
    Exhausted {
        status: u16,
        attempts: u32,
        body: String,
    },

    /// Non-retryable provider error (4xx other than auth/429)
    #[error("provider error (status {status}): {body}")]
    Rejected { status: u16, body: String },

    /// Connection-level failure after retries
    #[error("transport error: {0}")]
    Transport(String),
}

/// Shared HTTP client wrapper carrying the gateway's retry policy
pub struct LlmHttpClient {
    client: Client,
}

impl LlmHttpClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Client without a total-request timeout, for streaming responses
    /// (the stream pump enforces its own wall-clock ceiling).
    pub fn new_streaming() -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute a request with retries. `build` is called per attempt so
    /// the body can be re-sent. Retries only on 429/5xx; 401/403 are
    /// classified immediately; `Retry-After` is honored when present.
    pub async fn execute_with_retry<F>(
        &self,
        request_id: &str,
        build: F,
    ) -> Result<String, LlmHttpError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut backoff = BASE_BACKOFF;

        for attempt in 1..=MAX_ATTEMPTS {
            let response = match build(&self.client).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == MAX_ATTEMPTS {
                        return Err(LlmHttpError::Transport(e.to_string()));
                    }
                    warn!(
                        request_id = %request_id,
                        attempt,
                        error = %e,
                        "Request failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .text()
                    .await
                    .map_err(|e| LlmHttpError::Transport(e.to_string()));
            }

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(LlmHttpError::AuthRejected {
                    status: status.as_u16(),
                });
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();

            if !retryable {
                return Err(LlmHttpError::Rejected {
                    status: status.as_u16(),
                    body: truncate(&body, 500),
                });
            }

            if attempt == MAX_ATTEMPTS {
                return Err(LlmHttpError::Exhausted {
                    status: status.as_u16(),
                    attempts: attempt,
                    body: truncate(&body, 500),
                });
            }

            let wait = retry_after.unwrap_or_else(|| jittered(backoff)).min(MAX_BACKOFF);
            warn!(
                request_id = %request_id,
                status = %status,
                attempt,
                "Transient provider error, retrying in {:?}",
                wait
            );
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        unreachable!("retry loop always returns")
    }

    /// Send a streaming request once (no retries after headers are out),
    /// classifying auth failures the same way as the retry path.
    pub async fn send_streaming(
        &self,
        build: impl FnOnce(&Client) -> RequestBuilder,
    ) -> Result<Response, LlmHttpError> {
        let response = build(&self.client)
            .send()
            .await
            .map_err(|e| LlmHttpError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmHttpError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmHttpError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        Ok(response)
    }
}

impl Default for LlmHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply ±25% jitter so synchronized clients do not retry in lockstep
fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.75..=1.25);
    base.mul_f64(factor)
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
