// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::credential::pool::{PoolSettings, RefreshStrategy};
use crate::credential::refresh::UpstreamEndpoints;

/// Configuration for the kirogate credential gateway.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "kirogate", version, about = "Upstream credential pool and token API")]
pub struct GateConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "KIRO_GATE_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "PORT")]
    pub port: u16,

    /// Bearer token for the token management API. If unset, auth is disabled.
    #[arg(long, env = "KIRO_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Credential document: inline JSON or a path to a JSON file.
    #[arg(long, env = "KIRO_AUTH_TOKEN")]
    pub credentials: Option<String>,

    /// Default credential file, also the save target for inline credentials.
    #[arg(long, default_value = "auth_config.json", env = "KIRO_AUTH_CONFIG")]
    pub credentials_path: PathBuf,

    /// Seconds before a cached access token is revalidated.
    #[arg(long, default_value_t = 300, env = "KIRO_TOKEN_CACHE_TTL_SECS")]
    pub cache_ttl_secs: u64,

    /// How acquisition handles a credential without a usable token.
    #[arg(long, value_enum, default_value_t = RefreshStrategy::Lazy, env = "KIRO_REFRESH_STRATEGY")]
    pub refresh_strategy: RefreshStrategy,

    /// Upper bound for one token exchange or quota check.
    #[arg(long, default_value_t = 30, env = "KIRO_REFRESH_TIMEOUT_SECS")]
    pub refresh_timeout_secs: u64,

    /// Delay between dispatches when refreshing every credential.
    #[arg(long, default_value_t = 500, env = "KIRO_REFRESH_STAGGER_MS")]
    pub refresh_stagger_ms: u64,

    /// AWS region used to derive upstream endpoints.
    #[arg(long, default_value = "us-east-1", env = "AWS_REGION")]
    pub region: String,

    /// IDE version reported to the refresh endpoints.
    #[arg(long, default_value = "0.8.0", env = "KIRO_VERSION")]
    pub kiro_version: String,

    /// Override the social refresh endpoint.
    #[arg(long, env = "KIRO_SOCIAL_REFRESH_URL")]
    pub social_refresh_url: Option<String>,

    /// Override the IdC token endpoint.
    #[arg(long, env = "KIRO_IDC_REFRESH_URL")]
    pub idc_refresh_url: Option<String>,

    /// Override the usage limits endpoint.
    #[arg(long, env = "KIRO_USAGE_LIMITS_URL")]
    pub usage_limits_url: Option<String>,

    /// Log format (json or text).
    #[arg(long, default_value = "text", env = "KIRO_LOG_FORMAT")]
    pub log_format: String,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info", env = "KIRO_LOG_LEVEL")]
    pub log_level: String,
}

impl GateConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn refresh_stagger(&self) -> Duration {
        Duration::from_millis(self.refresh_stagger_ms)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            cache_ttl: self.cache_ttl(),
            strategy: self.refresh_strategy,
            refresh_timeout: self.refresh_timeout(),
            refresh_stagger: self.refresh_stagger(),
        }
    }

    /// Region defaults with any explicit URL overrides applied.
    pub fn endpoints(&self) -> UpstreamEndpoints {
        let mut endpoints = UpstreamEndpoints::for_region(&self.region);
        endpoints.kiro_version = self.kiro_version.clone();
        if let Some(ref url) = self.social_refresh_url {
            endpoints.social_refresh_url = url.clone();
        }
        if let Some(ref url) = self.idc_refresh_url {
            endpoints.idc_refresh_url = url.clone();
        }
        if let Some(ref url) = self.usage_limits_url {
            endpoints.usage_limits_url = url.clone();
        }
        endpoints
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_timeout_secs == 0 {
            anyhow::bail!("--refresh-timeout-secs must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("--log-format must be json or text, got {:?}", self.log_format);
        }
        if self.admin_token.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("--admin-token must not be empty when set");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
