//! Authenticated access to the OpenStack REST APIs.
//!
//! Every GET goes through [`ApiClient::get_bytes`], which:
//! - asks the [`TokenGuard`] for a token that outlives the renewal threshold,
//! - on `401` refreshes the token and retries, at most `max_auth_retries`
//!   times, then gives up with [`Error::AuthExpired`],
//! - on `408`/`429`/`5xx` or a connect/timeout failure backs off
//!   exponentially up to [`RetryPolicy::max_attempts`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::TokenGuard;
use crate::{Error, Result};

/// Header carrying the Keystone token.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Backoff for transient HTTP failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_cap = delay.as_millis() as u64 / 4;
        if jitter_cap == 0 {
            return delay;
        }
        let jitter = getrandom::u64().unwrap_or(0) % (jitter_cap + 1);
        delay + Duration::from_millis(jitter)
    }
}

/// Statuses worth retrying with backoff.
pub fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// HTTP client bound to the shared credential.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    guard: Arc<TokenGuard>,
    max_auth_retries: u32,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        client: reqwest::Client,
        guard: Arc<TokenGuard>,
        max_auth_retries: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            guard,
            max_auth_retries,
            retry,
        }
    }

    /// GET `url` and decode the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get_bytes(url).await?;
        serde_json::from_slice(&body).map_err(|e| Error::UnexpectedResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// GET `url` with the auth and transient retry policies applied.
    ///
    /// The two budgets are independent: a token refresh does not use up a
    /// transient attempt and a transient retry does not reset `auth_retries`.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut token = self.guard.ensure_valid().await?;
        let mut auth_retries = 0u32;
        // Failed transient attempts so far.
        let mut attempt = 0u32;

        loop {
            let sent = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .header(AUTH_TOKEN_HEADER, token.expose_secret())
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(%url, attempt, error = %e, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(Error::Request(e)),
            };

            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED {
                if auth_retries >= self.max_auth_retries {
                    return Err(Error::AuthExpired {
                        url: url.to_string(),
                        attempts: auth_retries + 1,
                    });
                }
                auth_retries += 1;
                warn!(%url, "token rejected, refreshing and retrying");
                token = self.guard.force_refresh(&token).await?;
                continue;
            }

            if is_transient(status) {
                attempt += 1;
                if attempt >= self.retry.max_attempts {
                    return Err(Error::TransientHttp {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                let delay = self.retry.delay_for(attempt);
                warn!(%url, status = status.as_u16(), attempt, ?delay, "transient HTTP failure, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::Http {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body,
                });
            }

            debug!(%url, status = status.as_u16(), "GET ok");
            return Ok(resp.bytes().await?.to_vec());
        }
    }
}
