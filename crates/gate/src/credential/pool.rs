// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token pool: rotates access tokens across an ordered list of credentials.
//!
//! One mutex guards the credential list, the cache of exchanged tokens, the
//! rotation cursor, the exhausted set and the in-flight set. Cache entries are
//! keyed by list position, so removals re-key every later entry. Network calls
//! never run under the lock: a refresh releases it for the exchange and quota
//! check, then re-acquires it and only commits if the position still holds
//! the same credential.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::credential::quota::{compute_available, QuotaInspector, UsageLimits};
use crate::credential::refresh::{AccessToken, RefreshGateway};
use crate::credential::{AuthError, AuthMethod, CredentialRecord};
use crate::state::epoch_ms;

/// Units assumed available when the quota check fails after a successful
/// refresh. Applies to both refresh strategies.
pub const QUOTA_FALLBACK_AVAILABLE: f64 = 1.0;

/// What `acquire` does with a position that has no usable cached token.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStrategy {
    /// Refresh synchronously (lock released) and use the result right away.
    #[default]
    Lazy,
    /// Schedule a background refresh and move on to the next position.
    Background,
}

/// Tunables for a [`TokenPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Age after which a cached token is revalidated.
    pub cache_ttl: Duration,
    pub strategy: RefreshStrategy,
    /// Upper bound for each exchange and each quota check.
    pub refresh_timeout: Duration,
    /// Delay between dispatches in [`TokenPool::refresh_all`].
    pub refresh_stagger: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            strategy: RefreshStrategy::Lazy,
            refresh_timeout: Duration::from_secs(30),
            refresh_stagger: Duration::from_millis(500),
        }
    }
}

/// Derived state for one credential, produced by a completed refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedToken {
    pub token: AccessToken,
    pub quota: Option<UsageLimits>,
    pub cached_at_ms: u64,
    pub last_used_ms: Option<u64>,
    /// Remaining dispensable units, never negative.
    pub available: f64,
}

impl CachedToken {
    pub fn is_usable_at(&self, now_ms: u64) -> bool {
        !self.token.is_expired_at(now_ms) && self.available > 0.0
    }

    fn is_stale_at(&self, now_ms: u64, ttl: Duration) -> bool {
        u128::from(now_ms.saturating_sub(self.cached_at_ms)) > ttl.as_millis()
    }
}

/// A dispensed token.
#[derive(Debug, Clone)]
pub struct TokenLease {
    /// Position the token was dispensed from.
    pub index: usize,
    pub token: AccessToken,
    pub quota: Option<UsageLimits>,
    /// Units left after this dispense. A lease taken from a credential with
    /// one unit reports `0.0`.
    pub available: f64,
}

/// Read-only view of one position for status displays.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub index: usize,
    pub auth: AuthMethod,
    pub fingerprint: String,
    pub enabled: bool,
    pub cached: Option<CachedToken>,
    pub exhausted: bool,
    pub refreshing: bool,
}

/// A removed position with its cache state, enough to undo the removal.
pub(crate) struct Removed {
    pub(crate) record: CredentialRecord,
    entry: Option<CachedToken>,
    exhausted: bool,
    cursor: usize,
}

struct PoolInner {
    records: Vec<CredentialRecord>,
    entries: HashMap<usize, CachedToken>,
    cursor: usize,
    exhausted: HashSet<usize>,
    /// Position -> ticket of the refresh currently running for it.
    in_flight: HashMap<usize, u64>,
}

impl PoolInner {
    fn advance_past(&mut self, index: usize) {
        self.cursor = match self.records.len() {
            0 => 0,
            len => (index + 1) % len,
        };
    }

    fn holds(&self, index: usize, record: &CredentialRecord) -> bool {
        self.records.get(index).is_some_and(|r| r.same_identity(record))
    }

    fn dispense(&mut self, index: usize, now_ms: u64) -> Option<TokenLease> {
        let entry = self.entries.get_mut(&index)?;
        entry.available = (entry.available - 1.0).max(0.0);
        entry.last_used_ms = Some(now_ms);
        let lease = TokenLease {
            index,
            token: entry.token.clone(),
            quota: entry.quota.clone(),
            available: entry.available,
        };
        self.advance_past(index);
        tracing::debug!(index, available = lease.available, "token dispensed");
        Some(lease)
    }

    /// Clear the in-flight marker and store the outcome if `index` still
    /// refers to `record`. Returns whether a fresh entry was written.
    fn commit(
        &mut self,
        index: usize,
        record: &CredentialRecord,
        ticket: u64,
        outcome: Result<CachedToken, AuthError>,
    ) -> bool {
        self.in_flight.retain(|_, t| *t != ticket);

        if !self.holds(index, record) {
            tracing::warn!(
                index,
                fingerprint = %record.fingerprint(),
                "credential moved or removed during refresh, discarding result"
            );
            return false;
        }

        match outcome {
            Ok(entry) => {
                tracing::info!(
                    index,
                    auth = %record.auth,
                    available = entry.available,
                    "token refreshed"
                );
                self.entries.insert(index, entry);
                self.exhausted.remove(&index);
                true
            }
            Err(e) => {
                tracing::warn!(index, auth = %record.auth, err = %e, "token refresh failed");
                self.exhausted.insert(index);
                false
            }
        }
    }

    fn remove_at(&mut self, index: usize) -> Removed {
        let removed = Removed {
            record: self.records.remove(index),
            entry: self.entries.remove(&index),
            exhausted: self.exhausted.contains(&index),
            cursor: self.cursor,
        };
        let shift = |k: usize| match k.cmp(&index) {
            std::cmp::Ordering::Less => Some(k),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(k - 1),
        };
        self.entries = rekey(std::mem::take(&mut self.entries), shift);
        self.in_flight = rekey(std::mem::take(&mut self.in_flight), shift);
        self.exhausted = std::mem::take(&mut self.exhausted).into_iter().filter_map(shift).collect();
        if self.cursor >= self.records.len() {
            self.cursor = 0;
        }
        removed
    }

    fn insert_at(&mut self, index: usize, removed: Removed) -> usize {
        let index = index.min(self.records.len());
        self.records.insert(index, removed.record);
        let shift = |k: usize| Some(if k >= index { k + 1 } else { k });
        self.entries = rekey(std::mem::take(&mut self.entries), shift);
        self.in_flight = rekey(std::mem::take(&mut self.in_flight), shift);
        self.exhausted = std::mem::take(&mut self.exhausted).into_iter().filter_map(shift).collect();
        if let Some(entry) = removed.entry {
            self.entries.insert(index, entry);
        }
        if removed.exhausted {
            self.exhausted.insert(index);
        }
        self.cursor = removed.cursor % self.records.len();
        index
    }
}

fn rekey<V>(map: HashMap<usize, V>, shift: impl Fn(usize) -> Option<usize>) -> HashMap<usize, V> {
    map.into_iter().filter_map(|(k, v)| shift(k).map(|k| (k, v))).collect()
}

/// Owns the credential list and dispenses access tokens from it.
pub struct TokenPool {
    inner: Mutex<PoolInner>,
    gateway: Arc<dyn RefreshGateway>,
    quota: Arc<dyn QuotaInspector>,
    settings: PoolSettings,
    next_ticket: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl TokenPool {
    /// Create a pool over `records`. No refresh happens until the first
    /// `acquire` or an explicit refresh call.
    pub fn new(
        records: Vec<CredentialRecord>,
        gateway: Arc<dyn RefreshGateway>,
        quota: Arc<dyn QuotaInspector>,
        settings: PoolSettings,
    ) -> Arc<Self> {
        tracing::info!(
            count = records.len(),
            strategy = ?settings.strategy,
            ttl_secs = settings.cache_ttl.as_secs(),
            "token pool initialized"
        );
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                records,
                entries: HashMap::new(),
                cursor: 0,
                exhausted: HashSet::new(),
                in_flight: HashMap::new(),
            }),
            gateway,
            quota,
            settings,
            next_ticket: AtomicU64::new(1),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Dispense one usable access token, starting from the rotation cursor.
    ///
    /// Disabled positions are skipped without looking at the cache. A cached
    /// token older than the TTL is still served while usable, with a
    /// background refresh scheduled. Positions without a usable token are
    /// refreshed according to the pool's [`RefreshStrategy`]. Refresh and
    /// quota failures are logged and only mark the position exhausted.
    pub async fn acquire(self: &Arc<Self>) -> Result<TokenLease, AuthError> {
        let mut inner = self.inner.lock().await;
        let attempts = inner.records.len();
        if attempts == 0 {
            return Err(AuthError::NoTokenAvailable);
        }

        for _ in 0..attempts {
            let len = inner.records.len();
            if len == 0 {
                break;
            }
            let index = inner.cursor % len;
            let record = inner.records[index].clone();
            if !record.is_enabled() {
                inner.advance_past(index);
                continue;
            }

            let now = epoch_ms();
            let state = inner
                .entries
                .get(&index)
                .map(|e| (e.is_stale_at(now, self.settings.cache_ttl), e.is_usable_at(now)));

            match state {
                Some((false, true)) => {
                    if let Some(lease) = inner.dispense(index, now) {
                        return Ok(lease);
                    }
                }
                Some((true, true)) => {
                    if self.spawn_refresh(&mut inner, index, record.clone()) {
                        tracing::debug!(index, "serving stale token, refresh scheduled");
                    }
                    if let Some(lease) = inner.dispense(index, now) {
                        return Ok(lease);
                    }
                }
                Some((false, false)) => {}
                None | Some((true, false)) => match self.settings.strategy {
                    RefreshStrategy::Background => {
                        self.spawn_refresh(&mut inner, index, record.clone());
                    }
                    RefreshStrategy::Lazy => {
                        let Some(ticket) = self.begin_refresh(&mut inner, index) else {
                            tracing::debug!(index, "refresh already in flight, trying next");
                            inner.exhausted.insert(index);
                            inner.advance_past(index);
                            continue;
                        };
                        tracing::info!(index, auth = %record.auth, "refreshing token on demand");
                        let refresh = self.track_refresh(index, record.clone(), ticket);
                        drop(inner);
                        let committed = refresh.await.unwrap_or(false);
                        inner = self.inner.lock().await;
                        if committed && inner.holds(index, &record) {
                            let now = epoch_ms();
                            let usable =
                                inner.entries.get(&index).is_some_and(|e| e.is_usable_at(now));
                            if usable {
                                if let Some(lease) = inner.dispense(index, now) {
                                    return Ok(lease);
                                }
                            }
                        }
                    }
                },
            }

            if inner.holds(index, &record) {
                inner.exhausted.insert(index);
            }
            inner.advance_past(index);
            tracing::debug!(index, next = inner.cursor, "token unusable, trying next");
        }

        tracing::warn!(
            total = inner.records.len(),
            exhausted = inner.exhausted.len(),
            "no usable token in pool"
        );
        Err(AuthError::NoTokenAvailable)
    }

    /// Append a credential and schedule its first refresh if enabled.
    ///
    /// Returns the new position.
    pub async fn add(self: &Arc<Self>, record: CredentialRecord) -> Result<usize, AuthError> {
        let record = record.validated()?;
        let mut inner = self.inner.lock().await;
        inner.records.push(record.clone());
        let index = inner.records.len() - 1;
        tracing::info!(
            index,
            auth = %record.auth,
            fingerprint = %record.fingerprint(),
            "credential added"
        );
        if record.is_enabled() {
            self.spawn_refresh(&mut inner, index, record);
        }
        Ok(index)
    }

    /// Remove the credential at `index`, keeping every other cached entry
    /// under its shifted position.
    pub async fn remove(&self, index: usize) -> Result<CredentialRecord, AuthError> {
        Ok(self.take(index).await?.record)
    }

    /// Remove like [`TokenPool::remove`], keeping what [`TokenPool::restore`]
    /// needs to undo it.
    pub(crate) async fn take(&self, index: usize) -> Result<Removed, AuthError> {
        let mut inner = self.inner.lock().await;
        let len = inner.records.len();
        if index >= len {
            return Err(AuthError::IndexOutOfRange { index, len });
        }
        let removed = inner.remove_at(index);
        tracing::info!(
            index,
            fingerprint = %removed.record.fingerprint(),
            remaining = inner.records.len(),
            "credential removed"
        );
        Ok(removed)
    }

    /// Put a removed credential back at `index` with its cached token,
    /// exhaustion mark and the cursor it had, shifting later entries up.
    ///
    /// Used to undo a removal whose persistence failed. A refresh that was in
    /// flight for it is not resumed.
    pub(crate) async fn restore(&self, index: usize, removed: Removed) -> usize {
        let mut inner = self.inner.lock().await;
        let index = inner.insert_at(index, removed);
        tracing::info!(index, "credential restored");
        index
    }

    /// Toggle a credential. Enabling schedules a refresh.
    ///
    /// Returns whether the credential was enabled before.
    pub async fn set_enabled(
        self: &Arc<Self>,
        index: usize,
        enabled: bool,
    ) -> Result<bool, AuthError> {
        let mut inner = self.inner.lock().await;
        let len = inner.records.len();
        let record = inner.records.get_mut(index).ok_or(AuthError::IndexOutOfRange { index, len })?;
        let was_enabled = record.is_enabled();
        record.disabled = !enabled;
        let snapshot = record.clone();
        if enabled && !was_enabled {
            self.spawn_refresh(&mut inner, index, snapshot);
        }
        if was_enabled != enabled {
            tracing::info!(index, enabled, "credential toggled");
        }
        Ok(was_enabled)
    }

    /// Schedule one background refresh for `index`.
    ///
    /// A refresh already running for the position counts as scheduled.
    pub async fn refresh_one(self: &Arc<Self>, index: usize) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        let len = inner.records.len();
        let record =
            inner.records.get(index).cloned().ok_or(AuthError::IndexOutOfRange { index, len })?;
        if !record.is_enabled() {
            return Err(AuthError::CredentialDisabled(index));
        }
        if !self.spawn_refresh(&mut inner, index, record) {
            tracing::debug!(index, "refresh already in flight");
        }
        Ok(())
    }

    /// Refresh every enabled credential in the background, one dispatch per
    /// `refresh_stagger`.
    ///
    /// Credentials are captured by value now and re-located by identity just
    /// before each dispatch, so concurrent removals never redirect a refresh
    /// to another credential. Returns the number of credentials captured.
    pub async fn refresh_all(self: &Arc<Self>) -> usize {
        let snapshot: Vec<CredentialRecord> = self
            .inner
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.is_enabled())
            .cloned()
            .collect();
        let total = snapshot.len();
        tracing::info!(total, "refreshing all credentials");

        let pool = Arc::clone(self);
        self.tasks.spawn(async move {
            for (n, record) in snapshot.into_iter().enumerate() {
                if n > 0 {
                    tokio::select! {
                        _ = pool.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(pool.settings.refresh_stagger) => {}
                    }
                }
                let mut inner = pool.inner.lock().await;
                let Some(index) = inner.records.iter().position(|r| r.same_identity(&record))
                else {
                    tracing::warn!(
                        fingerprint = %record.fingerprint(),
                        "credential removed before refresh, skipping"
                    );
                    continue;
                };
                let current = inner.records[index].clone();
                if current.is_enabled() {
                    pool.spawn_refresh(&mut inner, index, current);
                }
            }
            tracing::debug!(total, "refresh-all dispatch finished");
        });
        total
    }

    /// Snapshot of every position. Never triggers a refresh.
    pub async fn statuses(&self) -> Vec<TokenStatus> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| TokenStatus {
                index,
                auth: record.auth,
                fingerprint: record.fingerprint(),
                enabled: record.is_enabled(),
                cached: inner.entries.get(&index).cloned(),
                exhausted: inner.exhausted.contains(&index),
                refreshing: inner.in_flight.contains_key(&index),
            })
            .collect()
    }

    pub async fn records(&self) -> Vec<CredentialRecord> {
        self.inner.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until every background refresh scheduled so far has finished.
    pub async fn wait_for_refreshes(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancel background refreshes and wait for them to release their markers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::debug!("token pool stopped");
    }

    /// Mark `index` in flight unless a refresh is already running for it.
    fn begin_refresh(&self, inner: &mut PoolInner, index: usize) -> Option<u64> {
        if inner.in_flight.contains_key(&index) {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        inner.in_flight.insert(index, ticket);
        Some(ticket)
    }

    /// Start a background refresh for `index` unless one is already running.
    fn spawn_refresh(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        index: usize,
        record: CredentialRecord,
    ) -> bool {
        let Some(ticket) = self.begin_refresh(inner, index) else {
            return false;
        };
        tracing::debug!(index, auth = %record.auth, "background refresh scheduled");
        drop(self.track_refresh(index, record, ticket));
        true
    }

    /// Run the refresh holding `ticket` as a tracked task that commits its own
    /// outcome. The marker is released even when whoever awaits the handle is
    /// dropped. The handle yields whether a fresh entry was written.
    fn track_refresh(
        self: &Arc<Self>,
        index: usize,
        record: CredentialRecord,
        ticket: u64,
    ) -> JoinHandle<bool> {
        let pool = Arc::clone(self);
        self.tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = pool.shutdown.cancelled() => {
                    Err(AuthError::RefreshFailed("cancelled by shutdown".to_owned()))
                }
                outcome = pool.run_refresh(&record) => outcome,
            };
            pool.inner.lock().await.commit(index, &record, ticket, outcome)
        })
    }

    /// Exchange `record` and look up its quota. Runs without the pool lock.
    async fn run_refresh(&self, record: &CredentialRecord) -> Result<CachedToken, AuthError> {
        let timeout = self.settings.refresh_timeout;
        let token = match tokio::time::timeout(timeout, self.gateway.exchange(record)).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => return Err(AuthError::RefreshFailed(format!("{e:#}"))),
            Err(_) => {
                return Err(AuthError::RefreshFailed(format!("timed out after {timeout:?}")))
            }
        };

        let (quota, available) = match tokio::time::timeout(timeout, self.quota.check(&token)).await
        {
            Ok(Ok(usage)) => {
                let available = compute_available(&usage);
                (Some(usage), available)
            }
            Ok(Err(e)) => quota_fallback(record, AuthError::QuotaCheckFailed(format!("{e:#}"))),
            Err(_) => quota_fallback(
                record,
                AuthError::QuotaCheckFailed(format!("timed out after {timeout:?}")),
            ),
        };

        Ok(CachedToken { token, quota, cached_at_ms: epoch_ms(), last_used_ms: None, available })
    }
}

fn quota_fallback(record: &CredentialRecord, err: AuthError) -> (Option<UsageLimits>, f64) {
    tracing::warn!(
        fingerprint = %record.fingerprint(),
        err = %err,
        fallback = QUOTA_FALLBACK_AVAILABLE,
        "quota unknown, assuming minimal availability"
    );
    (None, QUOTA_FALLBACK_AVAILABLE)
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
