// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refresh gateways: exchange a credential's refresh token for an access token.
//!
//! One HTTP implementation per [`AuthMethod`]; [`MethodRouter`] picks the
//! right one from the record. Retry policy is left to callers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::credential::{AuthMethod, CredentialRecord};
use crate::state::epoch_ms;

/// Lifetime assumed when the refresh endpoint omits `expiresIn`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// A short-lived upstream access token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    /// Absolute expiry as epoch milliseconds.
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

impl AccessToken {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    /// First few characters of the token followed by an ellipsis.
    pub fn masked(&self) -> String {
        let prefix: String = self.access_token.chars().take(8).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &self.masked())
            .field("expires_at_ms", &self.expires_at_ms)
            .field("profile_arn", &self.profile_arn)
            .finish()
    }
}

/// Performs the network exchange for one credential.
#[async_trait]
pub trait RefreshGateway: Send + Sync {
    async fn exchange(&self, record: &CredentialRecord) -> anyhow::Result<AccessToken>;
}

/// Upstream endpoints used by the HTTP gateways and the quota inspector.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoints {
    pub social_refresh_url: String,
    pub idc_refresh_url: String,
    pub usage_limits_url: String,
    /// IDE version reported in the user agent.
    pub kiro_version: String,
}

impl UpstreamEndpoints {
    /// Default endpoints for an AWS region.
    pub fn for_region(region: &str) -> Self {
        Self {
            social_refresh_url: format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken"),
            idc_refresh_url: format!("https://oidc.{region}.amazonaws.com/token"),
            usage_limits_url: format!(
                "https://q.{region}.amazonaws.com/getUsageLimits?origin=AI_EDITOR&resourceType=AGENTIC_REQUEST&isEmailRequired=true"
            ),
            kiro_version: "0.8.0".to_owned(),
        }
    }
}

/// Build the shared HTTP client used for refresh and quota calls.
pub fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    // reqwest is built without a bundled crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Stable device identifier derived from the refresh token.
pub fn machine_id(refresh_token: &str) -> String {
    let digest = Sha256::digest(format!("KotlinNativeAPI/{refresh_token}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn refresh_user_agent(kiro_version: &str, refresh_token: &str) -> String {
    format!("KiroIDE-{kiro_version}-{}", machine_id(refresh_token))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    profile_arn: Option<String>,
}

impl RefreshResponse {
    fn into_access_token(self) -> anyhow::Result<AccessToken> {
        if self.access_token.is_empty() {
            anyhow::bail!("refresh response carried an empty accessToken");
        }
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(AccessToken {
            access_token: self.access_token,
            expires_at_ms: epoch_ms().saturating_add(expires_in.saturating_mul(1000)),
            profile_arn: self.profile_arn,
        })
    }
}

async fn read_refresh_response(resp: reqwest::Response) -> anyhow::Result<AccessToken> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("refresh failed ({status}): {text}");
    }
    let body: RefreshResponse = resp.json().await?;
    body.into_access_token()
}

/// Social-login refresh: `POST {"refreshToken"}`.
pub struct SocialRefresher {
    http: reqwest::Client,
    url: String,
    kiro_version: String,
}

impl SocialRefresher {
    pub fn new(http: reqwest::Client, endpoints: &UpstreamEndpoints) -> Self {
        Self {
            http,
            url: endpoints.social_refresh_url.clone(),
            kiro_version: endpoints.kiro_version.clone(),
        }
    }
}

#[async_trait]
impl RefreshGateway for SocialRefresher {
    async fn exchange(&self, record: &CredentialRecord) -> anyhow::Result<AccessToken> {
        let resp = self
            .http
            .post(&self.url)
            .header("user-agent", refresh_user_agent(&self.kiro_version, &record.refresh_token))
            .json(&serde_json::json!({ "refreshToken": record.refresh_token }))
            .send()
            .await?;
        read_refresh_response(resp).await
    }
}

/// Identity Center OIDC refresh: `POST {"clientId","clientSecret","grantType","refreshToken"}`.
pub struct IdcRefresher {
    http: reqwest::Client,
    url: String,
    kiro_version: String,
}

impl IdcRefresher {
    pub fn new(http: reqwest::Client, endpoints: &UpstreamEndpoints) -> Self {
        Self {
            http,
            url: endpoints.idc_refresh_url.clone(),
            kiro_version: endpoints.kiro_version.clone(),
        }
    }
}

#[async_trait]
impl RefreshGateway for IdcRefresher {
    async fn exchange(&self, record: &CredentialRecord) -> anyhow::Result<AccessToken> {
        let (Some(client_id), Some(client_secret)) = (&record.client_id, &record.client_secret)
        else {
            anyhow::bail!("IdC credential is missing clientId/clientSecret");
        };
        let resp = self
            .http
            .post(&self.url)
            .header("user-agent", refresh_user_agent(&self.kiro_version, &record.refresh_token))
            .json(&serde_json::json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "grantType": "refresh_token",
                "refreshToken": record.refresh_token,
            }))
            .send()
            .await?;
        read_refresh_response(resp).await
    }
}

/// Dispatches each exchange to the gateway for the record's auth method.
pub struct MethodRouter {
    social: Arc<dyn RefreshGateway>,
    idc: Arc<dyn RefreshGateway>,
}

impl MethodRouter {
    pub fn new(social: Arc<dyn RefreshGateway>, idc: Arc<dyn RefreshGateway>) -> Self {
        Self { social, idc }
    }

    /// HTTP gateways for both methods sharing one client.
    pub fn http(http: reqwest::Client, endpoints: &UpstreamEndpoints) -> Self {
        Self::new(
            Arc::new(SocialRefresher::new(http.clone(), endpoints)),
            Arc::new(IdcRefresher::new(http, endpoints)),
        )
    }
}

#[async_trait]
impl RefreshGateway for MethodRouter {
    async fn exchange(&self, record: &CredentialRecord) -> anyhow::Result<AccessToken> {
        match record.auth {
            AuthMethod::Social => self.social.exchange(record).await,
            AuthMethod::Idc => self.idc.exchange(record).await,
        }
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
