// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auth facade: the pool plus the persisted credential document.
//!
//! Every mutation changes the pool and the document mirror together and
//! writes the document. A failed write rolls both back before the error is
//! returned, so the pool never holds state that a restart would lose.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::credential::persist::{self, LoadedCredentials};
use crate::credential::pool::{PoolSettings, TokenLease, TokenPool, TokenStatus};
use crate::credential::quota::QuotaInspector;
use crate::credential::refresh::RefreshGateway;
use crate::credential::{AuthError, CredentialRecord};

pub struct AuthService {
    pool: Arc<TokenPool>,
    /// Index-aligned mirror of the pool's list, as written to disk.
    /// Held for the whole of each mutation.
    configs: Mutex<Vec<CredentialRecord>>,
    persist_path: PathBuf,
}

impl AuthService {
    pub fn new(
        loaded: LoadedCredentials,
        gateway: Arc<dyn RefreshGateway>,
        quota: Arc<dyn QuotaInspector>,
        settings: PoolSettings,
    ) -> Self {
        let pool = TokenPool::new(loaded.records.clone(), gateway, quota, settings);
        Self { pool, configs: Mutex::new(loaded.records), persist_path: loaded.persist_path }
    }

    /// Dispense one token at startup so the first request finds a warm cache.
    pub async fn warm_up(&self) {
        if self.pool.is_empty().await {
            tracing::info!("no credentials configured, add them through the token API");
            return;
        }
        match self.pool.acquire().await {
            Ok(lease) => tracing::info!(index = lease.index, "token pool warmed up"),
            Err(e) => tracing::warn!(err = %e, "token warm-up failed"),
        }
    }

    pub async fn acquire(&self) -> Result<TokenLease, AuthError> {
        self.pool.acquire().await
    }

    /// Add a credential and persist the document.
    pub async fn add(&self, record: CredentialRecord) -> Result<usize, AuthError> {
        let record = record.validated()?;
        let mut configs = self.configs.lock().await;
        let index = self.pool.add(record.clone()).await?;
        configs.push(record);

        if let Err(e) = persist::save(&self.persist_path, &configs) {
            configs.pop();
            if let Err(undo) = self.pool.remove(index).await {
                tracing::error!(index, err = %undo, "failed to undo credential add");
            }
            return Err(self.rolled_back("add", e, configs.len()));
        }

        tracing::info!(index, total = configs.len(), "credential added and saved");
        Ok(index)
    }

    /// Remove the credential at `index` and persist the document.
    pub async fn remove(&self, index: usize) -> Result<CredentialRecord, AuthError> {
        let mut configs = self.configs.lock().await;
        let len = configs.len();
        if index >= len {
            return Err(AuthError::IndexOutOfRange { index, len });
        }
        let removed = self.pool.take(index).await?;
        let mirrored = configs.remove(index);

        if let Err(e) = persist::save(&self.persist_path, &configs) {
            configs.insert(index, mirrored);
            self.pool.restore(index, removed).await;
            return Err(self.rolled_back("remove", e, configs.len()));
        }

        tracing::info!(index, remaining = configs.len(), "credential removed and saved");
        Ok(removed.record)
    }

    /// Enable or disable the credential at `index` and persist the document.
    pub async fn set_enabled(&self, index: usize, enabled: bool) -> Result<(), AuthError> {
        let mut configs = self.configs.lock().await;
        let len = configs.len();
        if index >= len {
            return Err(AuthError::IndexOutOfRange { index, len });
        }
        let was_enabled = self.pool.set_enabled(index, enabled).await?;
        if was_enabled == enabled {
            return Ok(());
        }
        configs[index].disabled = !enabled;

        if let Err(e) = persist::save(&self.persist_path, &configs) {
            configs[index].disabled = !was_enabled;
            if let Err(undo) = self.pool.set_enabled(index, was_enabled).await {
                tracing::error!(index, err = %undo, "failed to undo credential toggle");
            }
            return Err(self.rolled_back("toggle", e, configs.len()));
        }
        Ok(())
    }

    pub async fn refresh_one(&self, index: usize) -> Result<(), AuthError> {
        self.pool.refresh_one(index).await
    }

    /// Schedule a staggered refresh of every enabled credential.
    ///
    /// Returns how many credentials will be refreshed.
    pub async fn refresh_all(&self) -> usize {
        self.pool.refresh_all().await
    }

    pub async fn statuses(&self) -> Vec<TokenStatus> {
        self.pool.statuses().await
    }

    pub async fn count(&self) -> usize {
        self.configs.lock().await.len()
    }

    /// Copy of the persisted document.
    pub async fn configs(&self) -> Vec<CredentialRecord> {
        self.configs.lock().await.clone()
    }

    pub fn persist_path(&self) -> &Path {
        &self.persist_path
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn rolled_back(&self, op: &str, err: anyhow::Error, total: usize) -> AuthError {
        tracing::error!(
            op,
            path = %self.persist_path.display(),
            total,
            err = %format!("{err:#}"),
            "failed to save credentials, change rolled back"
        );
        AuthError::PersistenceFailed(format!("{err:#}"))
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
