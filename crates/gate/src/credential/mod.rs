// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Upstream credentials: records, validation, and the pool that rotates them.
//!
//! Each [`CredentialRecord`] holds the refresh material for one upstream
//! identity. The [`pool::TokenPool`] exchanges records for short-lived access
//! tokens and hands them out round-robin; [`service::AuthService`] keeps the
//! persisted document in step with the pool.

pub mod persist;
pub mod pool;
pub mod quota;
pub mod refresh;
pub mod service;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a credential exchanges its refresh token for an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Social login refresh endpoint; needs only the refresh token.
    #[default]
    Social,
    /// IAM Identity Center OIDC; needs a client id/secret pair.
    #[serde(rename = "IdC")]
    Idc,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Social => "Social",
            Self::Idc => "IdC",
        }
    }

    /// Whether records of this method must carry a client id/secret pair.
    pub fn requires_client(&self) -> bool {
        matches!(self, Self::Idc)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream identity as stored in the credential document.
///
/// Records are never edited in place apart from the `disabled` flag;
/// replacing one means removing it and adding the new one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    #[serde(rename = "auth", default)]
    pub auth: AuthMethod,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl CredentialRecord {
    pub fn social(refresh_token: impl Into<String>) -> Self {
        Self {
            auth: AuthMethod::Social,
            refresh_token: refresh_token.into(),
            client_id: None,
            client_secret: None,
            disabled: false,
        }
    }

    pub fn idc(
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            auth: AuthMethod::Idc,
            refresh_token: refresh_token.into(),
            client_id: Some(client_id.into()),
            client_secret: Some(client_secret.into()),
            disabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    /// Normalize empty optional fields and check the per-method invariants.
    ///
    /// The refresh token must be non-empty, and the client pair must be
    /// present exactly when the auth method requires it.
    pub fn validated(mut self) -> Result<Self, AuthError> {
        self.client_id = self.client_id.filter(|s| !s.is_empty());
        self.client_secret = self.client_secret.filter(|s| !s.is_empty());

        if self.refresh_token.trim().is_empty() {
            return Err(AuthError::InvalidCredential("refreshToken must not be empty".to_owned()));
        }
        let has_client = self.client_id.is_some() && self.client_secret.is_some();
        let has_any_client = self.client_id.is_some() || self.client_secret.is_some();
        if self.auth.requires_client() && !has_client {
            return Err(AuthError::InvalidCredential(format!(
                "{} credentials require clientId and clientSecret",
                self.auth
            )));
        }
        if !self.auth.requires_client() && has_any_client {
            return Err(AuthError::InvalidCredential(format!(
                "{} credentials must not carry clientId or clientSecret",
                self.auth
            )));
        }
        Ok(self)
    }

    /// Whether `other` describes the same upstream identity.
    pub fn same_identity(&self, other: &CredentialRecord) -> bool {
        self.auth == other.auth && self.refresh_token == other.refresh_token
    }

    /// Short, log-safe identifier derived from the refresh token.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.refresh_token.as_bytes());
        digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("auth", &self.auth)
            .field("fingerprint", &self.fingerprint())
            .field("client_id", &self.client_id)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

/// Failures surfaced by the pool and the auth facade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    /// Record is missing fields required by its auth method.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    /// Exchanging refresh material for an access token failed.
    #[error("refresh failed: {0}")]
    RefreshFailed(String),
    /// The quota service could not be consulted.
    #[error("quota check failed: {0}")]
    QuotaCheckFailed(String),
    /// Every credential is disabled, exhausted, or failed to refresh.
    #[error("no token available")]
    NoTokenAvailable,
    #[error("index {index} out of range (pool has {len} credentials)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("credential {0} is disabled")]
    CredentialDisabled(usize),
    /// The in-memory change was rolled back because it could not be saved.
    #[error("failed to persist credentials: {0}")]
    PersistenceFailed(String),
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
