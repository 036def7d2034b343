// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::credential::AuthError;

/// Error codes for the gateway API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateError {
    Unauthorized,
    BadRequest,
    NotFound,
    ServiceUnavailable,
    Internal,
}

impl GateError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::ServiceUnavailable => 503,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AuthError> for GateError {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::InvalidCredential(_)
            | AuthError::IndexOutOfRange { .. }
            | AuthError::CredentialDisabled(_) => Self::BadRequest,
            AuthError::NoTokenAvailable
            | AuthError::RefreshFailed(_)
            | AuthError::QuotaCheckFailed(_) => Self::ServiceUnavailable,
            AuthError::PersistenceFailed(_) => Self::Internal,
        }
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Render an [`AuthError`] as an HTTP error response.
pub fn auth_error_response(err: &AuthError) -> (StatusCode, Json<ErrorResponse>) {
    GateError::from(err).to_http_response(err.to_string())
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
