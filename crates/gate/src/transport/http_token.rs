// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the token management endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::credential::pool::TokenStatus;
use crate::credential::quota::UsageLimits;
use crate::credential::{AuthMethod, CredentialRecord};
use crate::error::{auth_error_response, GateError};
use crate::state::GateState;

// -- Request/Response types ---------------------------------------------------

/// Outcome of a mutation or refresh request.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// One pool position as shown to operators. The access token is masked.
#[derive(Debug, Serialize)]
pub struct TokenView {
    pub index: usize,
    pub auth: AuthMethod,
    pub fingerprint: String,
    pub enabled: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<UsageLimits>,
    pub available: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_ms: Option<u64>,
    pub exhausted: bool,
    pub refreshing: bool,
}

impl From<TokenStatus> for TokenView {
    fn from(s: TokenStatus) -> Self {
        let cached = s.cached.as_ref();
        Self {
            index: s.index,
            auth: s.auth,
            fingerprint: s.fingerprint,
            enabled: s.enabled,
            cached: cached.is_some(),
            token: cached.map(|c| c.token.masked()),
            expires_at_ms: cached.map(|c| c.token.expires_at_ms),
            quota: cached.and_then(|c| c.quota.clone()),
            available: cached.map(|c| c.available).unwrap_or(0.0),
            cached_at_ms: cached.map(|c| c.cached_at_ms),
            last_used_ms: cached.and_then(|c| c.last_used_ms),
            exhausted: s.exhausted,
            refreshing: s.refreshing,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenListResponse {
    pub total: usize,
    pub tokens: Vec<TokenView>,
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

fn action(message: impl Into<String>, count: Option<usize>) -> Response {
    Json(ActionResponse { success: true, message: message.into(), count }).into_response()
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/tokens`: every position with its cache state.
pub async fn list_tokens(State(s): State<Arc<GateState>>) -> impl IntoResponse {
    let tokens: Vec<TokenView> = s.auth.statuses().await.into_iter().map(TokenView::from).collect();
    Json(TokenListResponse { total: tokens.len(), tokens })
}

/// `POST /api/v1/tokens`: add and persist a credential.
pub async fn add_token(
    State(s): State<Arc<GateState>>,
    Json(record): Json<CredentialRecord>,
) -> impl IntoResponse {
    let auth = record.auth;
    match s.auth.add(record).await {
        Ok(index) => {
            let count = s.auth.count().await;
            tracing::info!(index, auth = %auth, total = count, "token added via API");
            action(format!("{auth} credential added at index {index}"), Some(count))
        }
        Err(e) => auth_error_response(&e).into_response(),
    }
}

/// `DELETE /api/v1/tokens/{index}`: remove and persist.
pub async fn delete_token(
    State(s): State<Arc<GateState>>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    match s.auth.remove(index).await {
        Ok(_) => action(format!("credential {index} removed"), Some(s.auth.count().await)),
        Err(e) => auth_error_response(&e).into_response(),
    }
}

/// `PUT /api/v1/tokens/{index}/enabled`: toggle and persist.
pub async fn set_token_enabled(
    State(s): State<Arc<GateState>>,
    Path(index): Path<usize>,
    Json(req): Json<EnabledRequest>,
) -> impl IntoResponse {
    match s.auth.set_enabled(index, req.enabled).await {
        Ok(()) => {
            let verb = if req.enabled { "enabled" } else { "disabled" };
            action(format!("credential {index} {verb}"), None)
        }
        Err(e) => auth_error_response(&e).into_response(),
    }
}

/// `POST /api/v1/tokens/{index}/refresh`: schedule one background refresh.
pub async fn refresh_token(
    State(s): State<Arc<GateState>>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    match s.auth.refresh_one(index).await {
        Ok(()) => action(format!("refresh scheduled for credential {index}"), None),
        Err(e) => auth_error_response(&e).into_response(),
    }
}

/// `POST /api/v1/tokens/refresh-all`: staggered refresh of every enabled credential.
pub async fn refresh_all_tokens(State(s): State<Arc<GateState>>) -> impl IntoResponse {
    if s.auth.count().await == 0 {
        return GateError::BadRequest.to_http_response("no credentials to refresh").into_response();
    }
    let count = s.auth.refresh_all().await;
    tracing::info!(count, "refresh of all tokens triggered");
    action(format!("refresh scheduled for {count} credentials"), Some(count))
}
