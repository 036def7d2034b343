// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the gateway's token management API.

pub mod auth;
pub mod http;
pub mod http_token;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::GateState;

/// Build the axum `Router` with all gateway routes.
pub fn build_router(state: Arc<GateState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Token management
        .route("/api/v1/tokens", get(http_token::list_tokens).post(http_token::add_token))
        .route("/api/v1/tokens/refresh-all", post(http_token::refresh_all_tokens))
        .route("/api/v1/tokens/{index}", delete(http_token::delete_token))
        .route("/api/v1/tokens/{index}/enabled", put(http_token::set_token_enabled))
        .route("/api/v1/tokens/{index}/refresh", post(http_token::refresh_token))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
