//! Keystone credentials and the guard that keeps them fresh.
//!
//! A single [`TokenGuard`] is shared by every component that talks to an
//! OpenStack API. The credential sits behind an async mutex and the
//! check-and-refresh happens while the lock is held, so overlapping poll
//! cycles never fetch two tokens for the same expiry.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Renew when less than this much lifetime is left.
pub const DEFAULT_RENEWAL_THRESHOLD: Duration = Duration::from_secs(300);

/// A token and the instant it stops being accepted.
#[derive(Debug)]
pub struct Credential {
    token: SecretString,
    expires_at: SystemTime,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Lifetime left at `now`; zero once expired.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expires_at
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }
}

/// Source of fresh credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_token(&self) -> Result<Credential>;
}

// ---------------------------------------------------------------------------
// Keystone v2
// ---------------------------------------------------------------------------

/// Password-credential login against Keystone's v2.0 token endpoint.
pub struct KeystoneAuth {
    client: reqwest::Client,
    base_url: String,
    tenant: String,
    username: String,
    password: SecretString,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    id: String,
    expires: String,
}

impl KeystoneAuth {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tenant: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            tenant: tenant.into(),
            username: username.into(),
            password,
        }
    }
}

#[async_trait]
impl AuthProvider for KeystoneAuth {
    async fn get_token(&self) -> Result<Credential> {
        let url = format!("{}/v2.0/tokens", self.base_url.trim_end_matches('/'));
        debug!(%url, tenant = %self.tenant, "requesting keystone token");

        let body = json!({
            "auth": {
                "tenantName": self.tenant,
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password.expose_secret(),
                }
            }
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token request to {} failed: {}", url, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("malformed token response: {}", e)))?;

        let expires_at = parse_expiry(&parsed.access.token.expires)?;
        Ok(Credential::new(parsed.access.token.id, expires_at))
    }
}

/// Keystone reports expiry as an RFC 3339 timestamp in UTC, with or without
/// fractional seconds and the trailing `Z`.
pub fn parse_expiry(raw: &str) -> Result<SystemTime> {
    humantime::parse_rfc3339_weak(raw.trim())
        .map_err(|e| Error::Auth(format!("invalid token expiry '{}': {}", raw, e)))
}

// ---------------------------------------------------------------------------
// TokenGuard
// ---------------------------------------------------------------------------

/// Holds the shared credential and renews it when close to expiry.
pub struct TokenGuard {
    provider: Arc<dyn AuthProvider>,
    current: Mutex<Credential>,
    threshold: Duration,
}

impl TokenGuard {
    /// Obtain the initial credential. Failure here is fatal for the process.
    pub async fn connect(provider: Arc<dyn AuthProvider>, threshold: Duration) -> Result<Self> {
        let credential = provider.get_token().await?;
        info!("initial keystone token acquired");
        Ok(Self::with_credential(provider, credential, threshold))
    }

    pub fn with_credential(
        provider: Arc<dyn AuthProvider>,
        credential: Credential,
        threshold: Duration,
    ) -> Self {
        Self {
            provider,
            current: Mutex::new(credential),
            threshold,
        }
    }

    /// Make sure the held credential outlives the configured threshold and
    /// return its token.
    pub async fn ensure_valid(&self) -> Result<SecretString> {
        self.ensure_valid_with(self.threshold).await
    }

    /// Same as [`ensure_valid`](Self::ensure_valid) with an explicit threshold.
    pub async fn ensure_valid_with(&self, threshold: Duration) -> Result<SecretString> {
        let mut current = self.current.lock().await;
        let remaining = current.remaining(SystemTime::now());
        if remaining < threshold {
            debug!(remaining_secs = remaining.as_secs(), "token close to expiry");
            self.renew(&mut current).await?;
        }
        Ok(copy_secret(current.token()))
    }

    /// Replace the credential after the server rejected `stale`.
    ///
    /// If another caller already swapped the token, the newer one is returned
    /// without asking the provider again.
    pub async fn force_refresh(&self, stale: &SecretString) -> Result<SecretString> {
        let mut current = self.current.lock().await;
        if current.token().expose_secret() != stale.expose_secret() {
            debug!("token already renewed by a concurrent caller");
            return Ok(copy_secret(current.token()));
        }
        self.renew(&mut current).await?;
        Ok(copy_secret(current.token()))
    }

    /// Current token without any expiry check.
    pub async fn token(&self) -> SecretString {
        copy_secret(self.current.lock().await.token())
    }

    pub async fn expires_at(&self) -> SystemTime {
        self.current.lock().await.expires_at()
    }

    async fn renew(&self, current: &mut Credential) -> Result<()> {
        let fresh = self.provider.get_token().await?;
        if fresh.expires_at() <= current.expires_at() {
            warn!("auth provider returned a token that does not outlive the previous one");
        }
        *current = fresh;
        info!("ceilometer token has been renewed");
        Ok(())
    }
}

fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
