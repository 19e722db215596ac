//! Application access tokens from a client-credentials grant, cached until
//! shortly before they expire.

use crate::clock::SharedClock;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A token is replaced this long before the issuer says it expires.
const REFRESH_MARGIN_SECS: i64 = 60;
/// Lifetime assumed when the issuer omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 2 * 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AppTokenSource {
    client: Client,
    credentials: ClientCredentials,
    clock: SharedClock,
    cached: Mutex<Option<CachedToken>>,
}

impl AppTokenSource {
    pub fn new(client: Client, credentials: ClientCredentials, clock: SharedClock) -> Self {
        Self {
            client,
            credentials,
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached token, or fetches a new one when none is cached or it is due.
    ///
    /// The lock is held across the fetch, so concurrent callers wait for one refresh.
    pub async fn bearer(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if self.clock.now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Forgets the cached token, e.g. after the upstream rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn fetch(&self) -> Result<CachedToken> {
        info!("Requesting app token from {}", self.credentials.token_url);
        let response = self
            .client
            .post(&self.credentials.token_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", self.credentials.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow!("Failed to request app token: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("App token request failed with status {}", status);
            return Err(anyhow!(
                "App token request failed ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse app token response: {}", e))?;
        let lifetime = token
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_LIFETIME_SECS);
        debug!("App token valid for {}s", lifetime);
        Ok(CachedToken {
            value: token.access_token,
            refresh_at: self.clock.now()
                + Duration::seconds((lifetime - REFRESH_MARGIN_SECS).max(0)),
        })
    }
}
