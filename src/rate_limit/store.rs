use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::StoreError;
use crate::rate_limit::{Budget, LimiterKey};

/// Result of one conditional insert against the permit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The record was written; the permits count against the budget.
    Granted,
    /// Writing the record would exceed the budget. Nothing was written.
    Exhausted,
    /// A record with the same key and timestamp already exists.
    Collision,
}

/// Abstract storage interface for permit records.
///
/// A store is shared by every process enforcing the same budgets, so each
/// call to [`try_acquire`](PermitStore::try_acquire) must be atomic with
/// respect to concurrent callers elsewhere in the cluster.
#[async_trait]
pub trait PermitStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Expire old records for `key`, then record `permits` at `now_millis`
    /// only if the live total stays within `budget.amount()`.
    ///
    /// Both steps run in one transaction. A record is live while
    /// `timestamp > now_millis - timeframe`.
    async fn try_acquire(
        &self,
        key: &LimiterKey,
        budget: &Budget,
        permits: u64,
        now_millis: u64,
    ) -> Result<AcquireOutcome, Self::Error>;

    /// Sum of live permits currently recorded for `key`.
    async fn live_permits(
        &self,
        key: &LimiterKey,
        timeframe: Duration,
        now_millis: u64,
    ) -> Result<u64, Self::Error>;
}

#[async_trait]
impl<S: PermitStore + ?Sized> PermitStore for Arc<S> {
    type Error = S::Error;

    async fn try_acquire(
        &self,
        key: &LimiterKey,
        budget: &Budget,
        permits: u64,
        now_millis: u64,
    ) -> Result<AcquireOutcome, Self::Error> {
        (**self).try_acquire(key, budget, permits, now_millis).await
    }

    async fn live_permits(
        &self,
        key: &LimiterKey,
        timeframe: Duration,
        now_millis: u64,
    ) -> Result<u64, Self::Error> {
        (**self).live_permits(key, timeframe, now_millis).await
    }
}

/// Lower bound (exclusive) of the live window ending at `now_millis`.
///
/// `None` while the window still reaches back past the epoch: no record can
/// have expired yet, including one stamped at `0`.
pub(crate) fn window_floor(now_millis: u64, timeframe: Duration) -> Option<u64> {
    let span = u64::try_from(timeframe.as_millis()).unwrap_or(u64::MAX);
    now_millis.checked_sub(span)
}

fn is_live(stamp: u64, floor: Option<u64>) -> bool {
    match floor {
        Some(floor) => stamp > floor,
        None => true,
    }
}

/// Process-local permit store.
///
/// Suitable for a single process or for tests; it cannot enforce a budget
/// across a cluster. The mutex plays the role of the single conditional
/// insert statement.
#[derive(Default, Clone, Debug)]
pub struct InMemoryPermitStore {
    // key -> (timestamp_millis -> permits)
    records: Arc<Mutex<HashMap<LimiterKey, Vec<(u64, u64)>>>>,
}

impl InMemoryPermitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding at least one record.
    pub fn tracked_keys(&self) -> usize {
        self.records.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Number of records (live or not yet purged) held for `key`.
    pub fn record_count(&self, key: &LimiterKey) -> usize {
        self.records
            .lock()
            .map(|guard| guard.get(key).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl PermitStore for InMemoryPermitStore {
    type Error = StoreError;

    async fn try_acquire(
        &self,
        key: &LimiterKey,
        budget: &Budget,
        permits: u64,
        now_millis: u64,
    ) -> Result<AcquireOutcome, Self::Error> {
        let floor = window_floor(now_millis, budget.timeframe());
        let mut guard = self.records.lock().map_err(|_| StoreError::Poisoned)?;

        let live: u64 = match guard.get_mut(key) {
            Some(rows) => {
                rows.retain(|&(ts, _)| is_live(ts, floor));
                if rows.iter().any(|&(ts, _)| ts == now_millis) {
                    return Ok(AcquireOutcome::Collision);
                }
                rows.iter().map(|&(_, p)| p).sum()
            }
            None => 0,
        };
        if guard.get(key).is_some_and(Vec::is_empty) {
            // fully expired keys do not linger
            guard.remove(key);
        }

        match budget.amount().checked_sub(permits) {
            Some(headroom) if headroom >= live => {
                guard.entry(key.clone()).or_default().push((now_millis, permits));
                Ok(AcquireOutcome::Granted)
            }
            _ => Ok(AcquireOutcome::Exhausted),
        }
    }

    async fn live_permits(
        &self,
        key: &LimiterKey,
        timeframe: Duration,
        now_millis: u64,
    ) -> Result<u64, Self::Error> {
        let floor = window_floor(now_millis, timeframe);
        let guard = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .get(key)
            .map(|rows| rows.iter().filter(|&&(ts, _)| is_live(ts, floor)).map(|&(_, p)| p).sum())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LimiterKey {
        LimiterKey::new(1, 2, "login")
    }

    #[tokio::test]
    async fn grants_until_amount_then_reports_exhausted() {
        let store = InMemoryPermitStore::new();
        let budget = Budget::new(3, Duration::from_secs(10));
        assert_eq!(store.try_acquire(&key(), &budget, 2, 100).await.unwrap(), AcquireOutcome::Granted);
        assert_eq!(store.try_acquire(&key(), &budget, 1, 101).await.unwrap(), AcquireOutcome::Granted);
        assert_eq!(store.try_acquire(&key(), &budget, 1, 102).await.unwrap(), AcquireOutcome::Exhausted);
        assert_eq!(store.live_permits(&key(), budget.timeframe(), 102).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn same_timestamp_is_a_collision() {
        let store = InMemoryPermitStore::new();
        let budget = Budget::new(10, Duration::from_secs(10));
        store.try_acquire(&key(), &budget, 1, 500).await.unwrap();
        assert_eq!(store.try_acquire(&key(), &budget, 1, 500).await.unwrap(), AcquireOutcome::Collision);
    }

    #[tokio::test]
    async fn expired_rows_are_purged_on_acquire() {
        let store = InMemoryPermitStore::new();
        let budget = Budget::new(1, Duration::from_millis(1_000));
        store.try_acquire(&key(), &budget, 1, 1_000).await.unwrap();
        // exactly one timeframe later the first grant is expired
        assert_eq!(store.try_acquire(&key(), &budget, 1, 2_000).await.unwrap(), AcquireOutcome::Granted);
        assert_eq!(store.record_count(&key()), 1);
    }

    #[tokio::test]
    async fn grant_at_epoch_stays_live_for_its_window() {
        let store = InMemoryPermitStore::new();
        let budget = Budget::new(1, Duration::from_secs(60));
        assert_eq!(store.try_acquire(&key(), &budget, 1, 0).await.unwrap(), AcquireOutcome::Granted);
        assert_eq!(store.try_acquire(&key(), &budget, 1, 1).await.unwrap(), AcquireOutcome::Exhausted);
        assert_eq!(store.try_acquire(&key(), &budget, 1, 59_999).await.unwrap(), AcquireOutcome::Exhausted);
        assert_eq!(store.live_permits(&key(), budget.timeframe(), 59_999).await.unwrap(), 1);
        assert_eq!(store.try_acquire(&key(), &budget, 1, 60_000).await.unwrap(), AcquireOutcome::Granted);
    }

    #[test]
    fn floor_is_absent_until_window_passes_epoch() {
        assert_eq!(window_floor(0, Duration::from_secs(1)), None);
        assert_eq!(window_floor(999, Duration::from_secs(1)), None);
        assert_eq!(window_floor(1_000, Duration::from_secs(1)), Some(0));
        assert_eq!(window_floor(5, Duration::MAX), None);
    }

    #[tokio::test]
    async fn expired_keys_are_forgotten() {
        let store = InMemoryPermitStore::new();
        let budget = Budget::new(1, Duration::from_millis(100));
        let other = LimiterKey::new(9, 9, "upload");
        store.try_acquire(&key(), &budget, 1, 1_000).await.unwrap();
        assert_eq!(store.tracked_keys(), 1);

        // a denial on an unseen key allocates nothing
        let tiny = Budget::new(0, Duration::from_millis(100));
        assert_eq!(store.try_acquire(&other, &tiny, 1, 1_050).await.unwrap(), AcquireOutcome::Exhausted);
        assert_eq!(store.tracked_keys(), 1);

        // once its grant expires, a denied request on the key drops the entry
        assert_eq!(store.try_acquire(&key(), &tiny, 1, 1_200).await.unwrap(), AcquireOutcome::Exhausted);
        assert_eq!(store.tracked_keys(), 0);
        assert_eq!(store.record_count(&key()), 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = InMemoryPermitStore::new();
        let budget = Budget::new(1, Duration::from_secs(10));
        let other = LimiterKey::new(1, 3, "login");
        assert_eq!(store.try_acquire(&key(), &budget, 1, 10).await.unwrap(), AcquireOutcome::Granted);
        assert_eq!(store.try_acquire(&other, &budget, 1, 10).await.unwrap(), AcquireOutcome::Granted);
    }
}
