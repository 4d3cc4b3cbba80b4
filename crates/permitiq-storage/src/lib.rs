//! Retrying HTTP fetch utilities + table store adapters for PermitIQ.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use store::{
    parse_content_range_total, upsert_columns, MemoryStore, PermitStore, PostgrestStore, StoreConfig, StoreError,
};

pub const CRATE_NAME: &str = "permitiq-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Fallback timeout for requests that do not pass their own.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// GET client with bounded retry on transient failures. One request at a time
/// per call; callers sequence their own pagination.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url` with `query`, retrying 429/5xx, timeouts and connect errors.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, timeout_ms = timeout.as_millis() as u64);
        self.fetch_with_retry(url, query, timeout).instrument(span).await
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let (err, disposition) = match self.fetch_once(url, query, timeout).await {
                Ok(fetched) => return Ok(fetched),
                Err(failure) => failure,
            };
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(error = %err, attempt, ?delay, "transient fetch failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<FetchedResponse, (FetchError, RetryDisposition)> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                let disposition = classify_reqwest_error(&err);
                (FetchError::Request(err), disposition)
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err((
                FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
                classify_status(status),
            ));
        }

        // A body cut short by a timeout or reset after a good status is transient.
        let body = resp
            .bytes()
            .await
            .map_err(|err| (FetchError::Request(err), RetryDisposition::Retryable))?;
        Ok(FetchedResponse {
            status,
            final_url,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedServer};

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("permitiq-test".into()),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        })
        .expect("fetcher")
    }

    #[test]
    fn default_backoff_doubles_from_one_second_up_to_eight() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 3);
        let delays: Vec<u64> = (0..6).map(|i| policy.delay_for_attempt(i).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(8));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        for code in [429u16, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{code}");
        }
        for code in [400u16, 401, 403, 404] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{code}");
        }
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let server = ScriptedServer::start(vec![
            Reply::empty(503),
            Reply::empty(429),
            Reply::json(200, r#"{"count":3}"#),
        ])
        .await;

        let fetched = fetcher(3)
            .fetch_bytes(&server.url("/query"), &[("f", "json".into())], Duration::from_secs(5))
            .await
            .expect("third attempt succeeds");

        assert_eq!(fetched.body, br#"{"count":3}"#.to_vec());
        assert_eq!(server.connections(), 3);
        assert!(server.requests()[0].starts_with("GET /query?f=json HTTP/1.1"));
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_bound() {
        let server = ScriptedServer::start(vec![Reply::empty(500)]).await;

        let err = fetcher(2)
            .fetch_bytes(&server.url("/query"), &[], Duration::from_secs(5))
            .await
            .expect_err("server keeps failing");

        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
        assert_eq!(server.connections(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = ScriptedServer::start(vec![Reply::empty(404), Reply::json(200, "{}")]).await;

        let err = fetcher(3)
            .fetch_bytes(&server.url("/missing"), &[], Duration::from_secs(5))
            .await
            .expect_err("404 is final");

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn body_timeout_is_retried() {
        let server = ScriptedServer::start(vec![
            Reply::stalled(100, r#"{"fe"#),
            Reply::json(200, r#"{"features":[]}"#),
        ])
        .await;

        let fetched = fetcher(3)
            .fetch_bytes(&server.url("/query"), &[], Duration::from_millis(300))
            .await
            .expect("second attempt succeeds");

        assert_eq!(fetched.body, br#"{"features":[]}"#.to_vec());
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn body_timeout_on_every_attempt_is_bounded() {
        let server = ScriptedServer::start(vec![Reply::stalled(100, "{")]).await;

        let err = fetcher(1)
            .fetch_bytes(&server.url("/query"), &[], Duration::from_millis(200))
            .await
            .expect_err("never completes");

        assert!(matches!(err, FetchError::Request(_)));
        assert_eq!(server.connections(), 2);
    }
}
