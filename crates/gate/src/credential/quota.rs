// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Quota inspection: how many more requests an access token can serve.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::refresh::{AccessToken, UpstreamEndpoints};

/// Resource type whose remaining amount bounds dispensing.
pub const CREDIT_RESOURCE: &str = "CREDIT";

/// Free-trial status that contributes to the available amount.
pub const TRIAL_ACTIVE: &str = "ACTIVE";

/// Usage snapshot returned by the upstream account service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_until_reset: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_date_reset: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_trial_info: Option<FreeTrialInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub free_trial_status: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

/// Remaining dispensable units for a usage snapshot.
///
/// Sums the base allocation of the first credit resource with its active
/// free-trial allocation, floored at zero. No credit resource means zero.
pub fn compute_available(usage: &UsageLimits) -> f64 {
    let Some(credit) =
        usage.usage_breakdown_list.iter().find(|b| b.resource_type == CREDIT_RESOURCE)
    else {
        return 0.0;
    };

    let mut total = credit.usage_limit_with_precision - credit.current_usage_with_precision;
    if let Some(trial) = credit.free_trial_info.as_ref().filter(|t| t.free_trial_status == TRIAL_ACTIVE)
    {
        total += trial.usage_limit_with_precision - trial.current_usage_with_precision;
    }
    total.max(0.0)
}

/// Looks up remaining usage for an access token.
#[async_trait]
pub trait QuotaInspector: Send + Sync {
    async fn check(&self, token: &AccessToken) -> anyhow::Result<UsageLimits>;
}

/// Queries the upstream `getUsageLimits` endpoint.
pub struct HttpQuotaInspector {
    http: reqwest::Client,
    url: String,
}

impl HttpQuotaInspector {
    pub fn new(http: reqwest::Client, endpoints: &UpstreamEndpoints) -> Self {
        Self { http, url: endpoints.usage_limits_url.clone() }
    }
}

#[async_trait]
impl QuotaInspector for HttpQuotaInspector {
    async fn check(&self, token: &AccessToken) -> anyhow::Result<UsageLimits> {
        let resp = self.http.get(&self.url).bearer_auth(&token.access_token).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("usage limits check failed ({status}): {text}");
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
#[path = "quota_tests.rs"]
mod tests;
