// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::Semaphore;

use super::*;
use crate::credential::quota::UsageBreakdown;

/// Exchanges `rt` into `at:<rt>:<n>`. Individual refresh tokens can be made
/// to fail or to block until the test releases them.
#[derive(Default)]
struct FakeGateway {
    calls: StdMutex<Vec<(String, Instant)>>,
    failing: StdMutex<HashSet<String>>,
    held: StdMutex<HashMap<String, Arc<Semaphore>>>,
    counter: AtomicU64,
}

impl FakeGateway {
    fn hold(&self, rt: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.held.lock().expect("lock").insert(rt.to_owned(), Arc::clone(&gate));
        gate
    }

    fn fail(&self, rt: &str) {
        self.failing.lock().expect("lock").insert(rt.to_owned());
    }

    fn count(&self, rt: &str) -> usize {
        self.calls.lock().expect("lock").iter().filter(|(r, _)| r == rt).count()
    }

    fn total(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }
}

#[async_trait]
impl RefreshGateway for FakeGateway {
    async fn exchange(&self, record: &CredentialRecord) -> anyhow::Result<AccessToken> {
        let rt = record.refresh_token.clone();
        self.calls.lock().expect("lock").push((rt.clone(), Instant::now()));
        let gate = self.held.lock().expect("lock").get(&rt).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await?;
        }
        if self.failing.lock().expect("lock").contains(&rt) {
            anyhow::bail!("upstream rejected {rt}");
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(AccessToken {
            access_token: format!("at:{rt}:{n}"),
            expires_at_ms: u64::MAX,
            profile_arn: None,
        })
    }
}

/// Reports a credit allocation per refresh token (default 100).
#[derive(Default)]
struct FakeQuota {
    credits: StdMutex<HashMap<String, f64>>,
    failing: StdMutex<HashSet<String>>,
}

impl FakeQuota {
    fn set(&self, rt: &str, credit: f64) {
        self.credits.lock().expect("lock").insert(rt.to_owned(), credit);
    }

    fn fail(&self, rt: &str) {
        self.failing.lock().expect("lock").insert(rt.to_owned());
    }
}

#[async_trait]
impl QuotaInspector for FakeQuota {
    async fn check(&self, token: &AccessToken) -> anyhow::Result<UsageLimits> {
        let rt = token.access_token.split(':').nth(1).unwrap_or_default().to_owned();
        if self.failing.lock().expect("lock").contains(&rt) {
            anyhow::bail!("usage service unavailable");
        }
        let credit = self.credits.lock().expect("lock").get(&rt).copied().unwrap_or(100.0);
        Ok(limits(credit))
    }
}

fn limits(credit: f64) -> UsageLimits {
    UsageLimits {
        usage_breakdown_list: vec![UsageBreakdown {
            resource_type: "CREDIT".to_owned(),
            usage_limit_with_precision: credit,
            ..Default::default()
        }],
        ..Default::default()
    }
}

struct Harness {
    pool: Arc<TokenPool>,
    gateway: Arc<FakeGateway>,
    quota: Arc<FakeQuota>,
}

fn harness(records: Vec<CredentialRecord>, strategy: RefreshStrategy) -> Harness {
    harness_with(records, PoolSettings { strategy, ..PoolSettings::default() })
}

fn harness_with(records: Vec<CredentialRecord>, settings: PoolSettings) -> Harness {
    let gateway = Arc::new(FakeGateway::default());
    let quota = Arc::new(FakeQuota::default());
    let pool = TokenPool::new(
        records,
        Arc::clone(&gateway) as Arc<dyn RefreshGateway>,
        Arc::clone(&quota) as Arc<dyn QuotaInspector>,
        settings,
    );
    Harness { pool, gateway, quota }
}

fn social(rt: &str) -> CredentialRecord {
    CredentialRecord::social(rt)
}

fn disabled(rt: &str) -> CredentialRecord {
    CredentialRecord { disabled: true, ..CredentialRecord::social(rt) }
}

fn cached(access_token: &str, available: f64, cached_at_ms: u64) -> CachedToken {
    CachedToken {
        token: AccessToken {
            access_token: access_token.to_owned(),
            expires_at_ms: u64::MAX,
            profile_arn: None,
        },
        quota: Some(limits(available)),
        cached_at_ms,
        last_used_ms: None,
        available,
    }
}

fn token_of(status: &TokenStatus) -> String {
    status.cached.as_ref().map(|c| c.token.access_token.clone()).unwrap_or_default()
}

#[tokio::test]
async fn empty_pool_has_no_token() {
    let h = harness(vec![], RefreshStrategy::Lazy);
    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
    assert_eq!(h.gateway.total(), 0);
}

#[tokio::test]
async fn dispenses_round_robin() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b"), social("rt-c")], RefreshStrategy::Lazy);

    let mut order = Vec::new();
    for _ in 0..6 {
        order.push(h.pool.acquire().await?.index);
    }
    assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    // One exchange per credential; later dispenses come from the cache.
    assert_eq!(h.gateway.total(), 3);
    Ok(())
}

#[tokio::test]
async fn available_decrements_to_zero_then_exhausts() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);
    h.quota.set("rt-a", 2.0);

    let first = h.pool.acquire().await?;
    assert_eq!(first.available, 1.0);
    assert!(first.token.access_token.starts_with("at:rt-a:"));
    let second = h.pool.acquire().await?;
    assert_eq!(second.available, 0.0);

    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
    let status = &h.pool.statuses().await[0];
    assert!(status.exhausted);
    assert_eq!(status.cached.as_ref().map(|c| c.available), Some(0.0));
    assert!(status.cached.as_ref().and_then(|c| c.last_used_ms).is_some());
    assert_eq!(h.gateway.total(), 1);
    Ok(())
}

#[tokio::test]
async fn disabled_credentials_are_skipped_without_refresh() -> anyhow::Result<()> {
    let h = harness(vec![disabled("rt-a"), social("rt-b")], RefreshStrategy::Lazy);

    assert_eq!(h.pool.acquire().await?.index, 1);
    assert_eq!(h.pool.acquire().await?.index, 1);
    assert_eq!(h.gateway.count("rt-a"), 0);
    assert!(!h.pool.statuses().await[0].exhausted);
    Ok(())
}

#[tokio::test]
async fn all_disabled_means_no_token() {
    let h = harness(vec![disabled("rt-a"), disabled("rt-b")], RefreshStrategy::Background);
    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
    h.pool.wait_for_refreshes().await;
    assert_eq!(h.gateway.total(), 0);
}

#[tokio::test]
async fn refresh_failure_marks_exhausted_and_moves_on() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Lazy);
    h.gateway.fail("rt-a");

    let lease = h.pool.acquire().await?;
    assert_eq!(lease.index, 1);

    let statuses = h.pool.statuses().await;
    assert!(statuses[0].exhausted);
    assert!(!statuses[0].refreshing);
    assert!(statuses[0].cached.is_none());
    Ok(())
}

async fn assert_quota_fallback(strategy: RefreshStrategy) -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], strategy);
    h.quota.fail("rt-a");

    if strategy == RefreshStrategy::Background {
        assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
        h.pool.wait_for_refreshes().await;
    }

    let lease = h.pool.acquire().await?;
    assert_eq!(lease.available, 0.0);
    assert!(lease.quota.is_none());
    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
    Ok(())
}

#[tokio::test]
async fn quota_failure_falls_back_to_one_unit_lazy() -> anyhow::Result<()> {
    assert_quota_fallback(RefreshStrategy::Lazy).await
}

#[tokio::test]
async fn quota_failure_falls_back_to_one_unit_background() -> anyhow::Result<()> {
    assert_quota_fallback(RefreshStrategy::Background).await
}

#[tokio::test]
async fn background_strategy_schedules_and_moves_on() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Background);

    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
    h.pool.wait_for_refreshes().await;
    assert_eq!(h.gateway.total(), 2);

    let statuses = h.pool.statuses().await;
    assert!(statuses.iter().all(|s| s.cached.is_some() && !s.exhausted));
    assert_eq!(h.pool.acquire().await?.index, 0);
    assert_eq!(h.pool.acquire().await?.index, 1);
    Ok(())
}

#[tokio::test]
async fn mixed_pool_walkthrough() -> anyhow::Result<()> {
    let h = harness(
        vec![disabled("rt-a"), social("rt-b"), social("rt-c")],
        RefreshStrategy::Background,
    );
    h.pool.inner.lock().await.entries.insert(1, cached("at-b", 3.0, epoch_ms()));
    let gate_c = h.gateway.hold("rt-c");

    let first = h.pool.acquire().await?;
    assert_eq!((first.index, first.token.access_token.as_str(), first.available), (1, "at-b", 2.0));
    let second = h.pool.acquire().await?;
    assert_eq!((second.index, second.available), (1, 1.0));
    assert!(h.pool.statuses().await[2].refreshing);
    let third = h.pool.acquire().await?;
    assert_eq!((third.index, third.available), (1, 0.0));

    // B is drained and C's refresh has not finished.
    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));

    gate_c.add_permits(1);
    h.pool.wait_for_refreshes().await;
    assert_eq!(h.gateway.count("rt-c"), 1);
    let fifth = h.pool.acquire().await?;
    assert_eq!(fifth.index, 2);
    assert!(fifth.token.access_token.starts_with("at:rt-c:"));
    assert_eq!(h.gateway.count("rt-a"), 0);
    Ok(())
}

#[tokio::test]
async fn stale_usable_token_is_served_while_refreshing() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);
    h.pool.inner.lock().await.entries.insert(0, cached("old", 5.0, 0));
    let gate = h.gateway.hold("rt-a");

    let lease = h.pool.acquire().await?;
    assert_eq!(lease.token.access_token, "old");
    assert_eq!(lease.available, 4.0);
    assert!(h.pool.statuses().await[0].refreshing);

    // A second stale hit does not start another exchange.
    assert_eq!(h.pool.acquire().await?.token.access_token, "old");

    gate.add_permits(1);
    h.pool.wait_for_refreshes().await;
    assert_eq!(h.gateway.count("rt-a"), 1);
    let status = &h.pool.statuses().await[0];
    assert!(token_of(status).starts_with("at:rt-a:"));
    assert_eq!(status.cached.as_ref().map(|c| c.available), Some(100.0));
    assert!(!status.refreshing);
    Ok(())
}

#[tokio::test]
async fn concurrent_refresh_requests_share_one_exchange() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Lazy);
    let gate = h.gateway.hold("rt-a");

    h.pool.refresh_one(0).await?;
    h.pool.refresh_one(0).await?;
    // Lazy acquire does not wait on the in-flight refresh; it moves on.
    assert_eq!(h.pool.acquire().await?.index, 1);

    gate.add_permits(1);
    h.pool.wait_for_refreshes().await;
    let status = &h.pool.statuses().await[0];
    assert!(!status.refreshing);
    assert!(!status.exhausted);
    assert_eq!(h.gateway.count("rt-a"), 1);
    Ok(())
}

#[tokio::test]
async fn remove_rekeys_cache_entries() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b"), social("rt-c")], RefreshStrategy::Lazy);
    for _ in 0..3 {
        h.pool.acquire().await?;
    }
    let before = h.pool.statuses().await;

    let removed = h.pool.remove(1).await?;
    assert_eq!(removed.refresh_token, "rt-b");

    let after = h.pool.statuses().await;
    assert_eq!(after.len(), 2);
    assert_eq!(after[1].cached, before[2].cached);
    assert_eq!(after[0].cached, before[0].cached);
    assert!(h.pool.inner.lock().await.entries.get(&2).is_none());

    assert_eq!(h.pool.acquire().await?.index, 0);
    let lease = h.pool.acquire().await?;
    assert_eq!(lease.index, 1);
    assert!(lease.token.access_token.starts_with("at:rt-c:"));
    assert_eq!(h.gateway.total(), 3);
    Ok(())
}

#[tokio::test]
async fn remove_resets_cursor_past_end() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Lazy);
    assert_eq!(h.pool.acquire().await?.index, 0);
    h.pool.remove(1).await?;
    assert_eq!(h.pool.inner.lock().await.cursor, 0);
    assert_eq!(h.pool.acquire().await?.index, 0);
    Ok(())
}

#[tokio::test]
async fn remove_out_of_range() {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);
    assert_eq!(h.pool.remove(5).await.err(), Some(AuthError::IndexOutOfRange { index: 5, len: 1 }));
    assert_eq!(h.pool.len().await, 1);
}

#[tokio::test]
async fn refresh_result_for_removed_credential_is_discarded() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Lazy);
    let gate = h.gateway.hold("rt-a");

    h.pool.refresh_one(0).await?;
    h.pool.remove(0).await?;
    gate.add_permits(1);
    h.pool.wait_for_refreshes().await;

    let statuses = h.pool.statuses().await;
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].cached.is_none(), "A's token must not land on B");
    assert!(!statuses[0].refreshing);
    assert!(!statuses[0].exhausted);
    Ok(())
}

#[tokio::test]
async fn restore_undoes_removal() -> anyhow::Result<()> {
    let h = harness(
        vec![social("rt-a"), social("rt-b"), social("rt-c")],
        RefreshStrategy::Lazy,
    );
    h.quota.set("rt-c", 1.0);
    for _ in 0..5 {
        h.pool.acquire().await?;
    }
    h.pool.inner.lock().await.exhausted.insert(2);
    let before = h.pool.statuses().await;
    assert_eq!(h.pool.inner.lock().await.cursor, 2);

    let removed = h.pool.take(2).await?;
    assert_eq!(h.pool.inner.lock().await.cursor, 0);
    assert_eq!(h.pool.restore(2, removed).await, 2);

    let after = h.pool.statuses().await;
    for (a, b) in after.iter().zip(&before) {
        assert_eq!(a.cached, b.cached);
        assert_eq!(a.exhausted, b.exhausted);
    }
    assert_eq!(h.pool.inner.lock().await.cursor, 2);
    // rt-c is spent, so rotation resumes at rt-a without a new exchange.
    assert_eq!(h.pool.acquire().await?.index, 0);
    assert_eq!(h.gateway.total(), 3);
    Ok(())
}

#[tokio::test]
async fn restore_in_the_middle_shifts_entries_up() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Lazy);
    h.pool.acquire().await?;
    h.pool.acquire().await?;
    let before = h.pool.statuses().await;

    let removed = h.pool.take(0).await?;
    assert_eq!(h.pool.restore(0, removed).await, 0);

    let statuses = h.pool.statuses().await;
    assert_eq!(statuses[0].cached, before[0].cached);
    assert!(token_of(&statuses[1]).starts_with("at:rt-b:"));
    Ok(())
}

#[tokio::test]
async fn refresh_all_follows_credentials_by_identity() -> anyhow::Result<()> {
    let settings = PoolSettings {
        refresh_stagger: Duration::from_millis(30),
        ..PoolSettings::default()
    };
    let h = harness_with(
        vec![social("rt-a"), social("rt-b"), disabled("rt-x"), social("rt-c")],
        settings,
    );

    assert_eq!(h.pool.refresh_all().await, 3);
    h.pool.remove(0).await?;
    h.pool.wait_for_refreshes().await;

    let statuses = h.pool.statuses().await;
    assert_eq!(statuses.len(), 3);
    assert!(token_of(&statuses[0]).starts_with("at:rt-b:"));
    assert!(statuses[1].cached.is_none());
    assert!(token_of(&statuses[2]).starts_with("at:rt-c:"));
    assert_eq!(h.gateway.count("rt-x"), 0);
    Ok(())
}

#[tokio::test]
async fn refresh_all_staggers_dispatch() {
    let settings = PoolSettings {
        refresh_stagger: Duration::from_millis(80),
        ..PoolSettings::default()
    };
    let h = harness_with(vec![social("rt-a"), social("rt-b"), social("rt-c")], settings);

    h.pool.refresh_all().await;
    h.pool.wait_for_refreshes().await;

    let calls = h.gateway.calls.lock().expect("lock").clone();
    assert_eq!(calls.len(), 3);
    let mut times: Vec<Instant> = calls.iter().map(|(_, t)| *t).collect();
    times.sort();
    assert!(times[2].duration_since(times[0]) >= Duration::from_millis(150));
}

#[tokio::test]
async fn refresh_one_rejects_disabled_and_missing() {
    let h = harness(vec![disabled("rt-a")], RefreshStrategy::Lazy);
    assert_eq!(h.pool.refresh_one(0).await.err(), Some(AuthError::CredentialDisabled(0)));
    assert_eq!(
        h.pool.refresh_one(3).await.err(),
        Some(AuthError::IndexOutOfRange { index: 3, len: 1 })
    );
}

#[tokio::test]
async fn toggling_enabled() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a"), social("rt-b")], RefreshStrategy::Lazy);

    assert!(h.pool.set_enabled(0, false).await?);
    assert_eq!(h.pool.acquire().await?.index, 1);
    assert_eq!(h.gateway.count("rt-a"), 0);

    assert!(!h.pool.set_enabled(0, true).await?);
    h.pool.wait_for_refreshes().await;
    assert_eq!(h.gateway.count("rt-a"), 1);
    assert!(h.pool.statuses().await[0].cached.is_some());

    assert_eq!(
        h.pool.set_enabled(9, true).await.err(),
        Some(AuthError::IndexOutOfRange { index: 9, len: 2 })
    );
    Ok(())
}

#[tokio::test]
async fn add_validates_and_schedules_refresh() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);

    let bad = CredentialRecord { client_id: None, ..CredentialRecord::idc("rt-i", "id", "secret") };
    assert!(matches!(h.pool.add(bad).await, Err(AuthError::InvalidCredential(_))));
    assert_eq!(h.pool.len().await, 1);

    assert_eq!(h.pool.add(social("rt-b")).await?, 1);
    assert_eq!(h.pool.add(disabled("rt-c")).await?, 2);
    h.pool.wait_for_refreshes().await;

    let statuses = h.pool.statuses().await;
    assert!(token_of(&statuses[1]).starts_with("at:rt-b:"));
    assert!(statuses[2].cached.is_none());
    assert_eq!(h.gateway.count("rt-c"), 0);
    Ok(())
}

#[tokio::test]
async fn slow_refresh_times_out() {
    let settings = PoolSettings {
        refresh_timeout: Duration::from_millis(50),
        ..PoolSettings::default()
    };
    let h = harness_with(vec![social("rt-a")], settings);
    let _gate = h.gateway.hold("rt-a");

    assert_eq!(h.pool.acquire().await.err(), Some(AuthError::NoTokenAvailable));
    let status = &h.pool.statuses().await[0];
    assert!(status.exhausted);
    assert!(!status.refreshing);
}

#[tokio::test]
async fn dropped_acquire_does_not_strand_the_refresh() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);
    let gate = h.gateway.hold("rt-a");

    let timed_out = tokio::time::timeout(Duration::from_millis(50), h.pool.acquire()).await;
    assert!(timed_out.is_err());
    assert!(h.pool.statuses().await[0].refreshing);

    // The refresh keeps running without its caller and commits on its own.
    gate.add_permits(1);
    h.pool.wait_for_refreshes().await;
    let status = &h.pool.statuses().await[0];
    assert!(!status.refreshing);
    assert!(token_of(status).starts_with("at:rt-a:"));

    let lease = h.pool.acquire().await?;
    assert_eq!(lease.index, 0);
    assert_eq!(h.gateway.count("rt-a"), 1);
    Ok(())
}

#[tokio::test]
async fn dropped_acquire_still_allows_explicit_refresh() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);
    h.gateway.fail("rt-a");
    let gate = h.gateway.hold("rt-a");

    let timed_out = tokio::time::timeout(Duration::from_millis(50), h.pool.acquire()).await;
    assert!(timed_out.is_err());
    gate.add_permits(1);
    h.pool.wait_for_refreshes().await;
    assert!(!h.pool.statuses().await[0].refreshing);

    h.gateway.failing.lock().expect("lock").clear();
    h.pool.refresh_one(0).await?;
    h.pool.wait_for_refreshes().await;
    assert_eq!(h.gateway.count("rt-a"), 2);
    assert_eq!(h.pool.acquire().await?.index, 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_pending_refreshes() -> anyhow::Result<()> {
    let h = harness(vec![social("rt-a")], RefreshStrategy::Lazy);
    let _gate = h.gateway.hold("rt-a");

    h.pool.refresh_one(0).await?;
    assert!(h.pool.statuses().await[0].refreshing);
    h.pool.shutdown().await;

    let status = &h.pool.statuses().await[0];
    assert!(!status.refreshing);
    assert!(status.cached.is_none());
    Ok(())
}

proptest! {
    #[test]
    fn healthy_pool_rotates_in_order(n in 1usize..6, k in 1usize..20) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let indices = rt.block_on(async {
            let records = (0..n).map(|i| social(&format!("rt-{i}"))).collect();
            let h = harness(records, RefreshStrategy::Lazy);
            let mut indices = Vec::with_capacity(k);
            for _ in 0..k {
                indices.push(h.pool.acquire().await.expect("lease").index);
            }
            indices
        });
        for (i, index) in indices.into_iter().enumerate() {
            prop_assert_eq!(index, i % n);
        }
    }
}
