// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Kirogate: upstream credential pool and token management API.

pub mod config;
pub mod credential;
pub mod error;
pub mod state;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::GateConfig;
use crate::credential::persist;
use crate::credential::quota::HttpQuotaInspector;
use crate::credential::refresh::{build_http_client, MethodRouter};
use crate::credential::service::AuthService;
use crate::state::GateState;
use crate::transport::build_router;

/// Initialize tracing/logging from config.
///
/// `RUST_LOG` wins over `--log-level`. Uses `try_init` so repeated calls
/// are harmless.
pub fn init_tracing(config: &GateConfig) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Resolve the credential document and wire the HTTP refresh gateways and
/// quota inspector into a new [`AuthService`].
pub fn build_auth_service(config: &GateConfig) -> anyhow::Result<AuthService> {
    let loaded = persist::resolve(config.credentials.as_deref(), &config.credentials_path)?;
    let endpoints = config.endpoints();
    let http = build_http_client(config.refresh_timeout())?;
    let gateway = Arc::new(MethodRouter::http(http.clone(), &endpoints));
    let quota = Arc::new(HttpQuotaInspector::new(http, &endpoints));
    Ok(AuthService::new(loaded, gateway, quota, config.pool_settings()))
}

/// Run the gateway until SIGINT/SIGTERM.
pub async fn run(config: GateConfig) -> anyhow::Result<()> {
    config.validate()?;
    let shutdown = CancellationToken::new();

    let auth = Arc::new(build_auth_service(&config)?);
    auth.warm_up().await;

    let addr = config.addr();
    if config.admin_token.is_none() {
        tracing::warn!("no admin token configured, token API is unauthenticated");
    }
    let state = Arc::new(GateState::new(config, Arc::clone(&auth), shutdown.clone()));
    spawn_signal_handler(shutdown.clone());

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(credentials = auth.count().await, "kirogate listening on {addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    auth.shutdown().await;
    tracing::info!("kirogate stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                tracing::info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                tracing::info!("received SIGINT");
            }
        }
        shutdown.cancel();
    });
}
