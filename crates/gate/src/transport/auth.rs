// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::GateError;
use crate::state::GateState;

/// Compare two secrets without short-circuiting on the first mismatch.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the admin Bearer token. `None` means the guard is disabled.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), GateError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(GateError::Unauthorized)?;

    if constant_time_eq(token.trim(), expected) {
        Ok(())
    } else {
        Err(GateError::Unauthorized)
    }
}

/// Axum middleware guarding the token API with the admin token.
///
/// Exempt: `/api/v1/health`.
pub async fn auth_layer(
    state: State<Arc<GateState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if req.uri().path() == "/api/v1/health" {
        return next.run(req).await;
    }

    if let Err(code) = validate_bearer(req.headers(), state.config.admin_token.as_deref()) {
        tracing::warn!(path = req.uri().path(), "rejected token API request");
        return code.to_http_response("admin token required").into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
