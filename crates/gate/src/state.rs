// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::GateConfig;
use crate::credential::service::AuthService;

/// Shared gateway state.
pub struct GateState {
    pub config: GateConfig,
    pub auth: Arc<AuthService>,
    pub shutdown: CancellationToken,
}

impl GateState {
    pub fn new(config: GateConfig, auth: Arc<AuthService>, shutdown: CancellationToken) -> Self {
        Self { config, auth, shutdown }
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
