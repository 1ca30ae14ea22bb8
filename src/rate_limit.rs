//! Permit accounting over a shared store.
//!
//! This module provides the building blocks for cluster-wide rate limiting:
//! - [`RateLimiter`]: the interface callers use to ask for permits.
//! - [`PermitLimiter`]: the trailing-window implementation over a [`PermitStore`].
//! - [`RateLimiterFactory`]: hands out limiters sharing one injected store.
//! - [`RateLimitLayer`]: Tower middleware that gates a service on a limiter.
//!
//! # Architecture
//!
//! - **Logic**: `PermitLimiter` validates the request, reads the clock, and
//!   retries once on a timestamp collision.
//! - **Storage**: `PermitStore` (in `store`) purges expired records and
//!   performs the conditional insert atomically. `sql` holds the `sqlx`
//!   backends used in a cluster; `InMemoryPermitStore` serves single
//!   processes and tests.
//!
//! Storage failures never reach the caller: they are logged and the request
//! is denied.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::DynamicConfig;
use crate::telemetry::{emit_best_effort, DenyReason, LimiterEvent, NullSink, TelemetrySink};

pub mod middleware;
pub mod registry;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod sql;
pub mod store;

pub use middleware::{RateLimitLayer, RateLimitService};
pub use registry::{InMemoryLimiterRegistry, LimiterRegistry, RegistryEvent};
use store::{AcquireOutcome, PermitStore};

/// Identifies one independent budget: scope (tenant), subject (user) and
/// limiter id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey {
    /// Scope or tenant id (`cid` column).
    pub scope: i32,
    /// Subject id within the scope (`userId` column).
    pub subject: i32,
    /// Discriminates budgets of the same subject (`id` column).
    pub limiter_id: String,
}

impl LimiterKey {
    pub fn new(scope: i32, subject: i32, limiter_id: impl Into<String>) -> Self {
        Self { scope, subject, limiter_id: limiter_id.into() }
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.subject, self.limiter_id)
    }
}

/// Total permits allowed per trailing timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    amount: u64,
    timeframe: Duration,
}

impl Budget {
    pub fn new(amount: u64, timeframe: Duration) -> Self {
        Self { amount, timeframe }
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn timeframe(&self) -> Duration {
        self.timeframe
    }
}

/// Core interface for admitting work against a budget.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Identifier reported when this limiter denies a request.
    fn id(&self) -> &str;

    /// Attempt to record `permits` against the budget.
    ///
    /// Returns `false` when the budget would be exceeded or the store is
    /// unavailable.
    async fn acquire_permits(&self, permits: u64) -> bool;

    /// Attempt to record a single permit.
    async fn acquire(&self) -> bool {
        self.acquire_permits(1).await
    }
}

/// Trailing-window permit limiter backed by a [`PermitStore`].
///
/// The budget lives in a [`DynamicConfig`] and is re-read on every call, so
/// [`set_budget`](Self::set_budget) takes effect for the next acquire.
pub struct PermitLimiter<S, T = NullSink> {
    store: Arc<S>,
    key: LimiterKey,
    budget: DynamicConfig<Budget>,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl<S> PermitLimiter<S, NullSink>
where
    S: PermitStore + 'static,
{
    pub fn new(store: Arc<S>, key: LimiterKey, budget: Budget) -> Self {
        Self {
            store,
            key,
            budget: DynamicConfig::new(budget),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<S, T> PermitLimiter<S, T>
where
    S: PermitStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Replace the clock used to stamp permit records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a telemetry sink.
    pub fn with_sink<U>(self, sink: U) -> PermitLimiter<S, U>
    where
        U: TelemetrySink,
    {
        PermitLimiter {
            store: self.store,
            key: self.key,
            budget: self.budget,
            clock: self.clock,
            sink,
        }
    }

    pub fn key(&self) -> &LimiterKey {
        &self.key
    }

    pub fn budget(&self) -> Budget {
        *self.budget.get()
    }

    /// Swap the budget; returns the previous one.
    pub fn set_budget(&self, budget: Budget) -> Budget {
        *self.budget.replace(budget)
    }

    /// Sum of live permits for this limiter's key, as the store sees it now.
    pub async fn live_permits(&self) -> Result<u64, S::Error> {
        let budget = self.budget();
        self.store.live_permits(&self.key, budget.timeframe(), self.clock.now_millis()).await
    }

    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn deny(&self, permits: u64, reason: DenyReason) -> bool {
        self.emit(LimiterEvent::Denied { key: self.key.clone(), permits, reason }).await;
        false
    }
}

impl<S, T> fmt::Debug for PermitLimiter<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitLimiter")
            .field("key", &self.key)
            .field("budget", &*self.budget.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S, T> RateLimiter for PermitLimiter<S, T>
where
    S: PermitStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    fn id(&self) -> &str {
        &self.key.limiter_id
    }

    async fn acquire_permits(&self, permits: u64) -> bool {
        if permits == 0 {
            return true;
        }
        let budget = self.budget();
        if permits > budget.amount() {
            debug!(
                target: "tallygate::rate_limit",
                limiter = %self.key.limiter_id,
                scope = self.key.scope,
                subject = self.key.subject,
                permits,
                amount = budget.amount(),
                "request larger than the whole budget"
            );
            return self.deny(permits, DenyReason::ExceedsBudget).await;
        }

        let first_stamp = self.clock.now_millis();
        let mut outcome = self.store.try_acquire(&self.key, &budget, permits, first_stamp).await;
        if let Ok(AcquireOutcome::Collision) = outcome {
            // one retry only, stamped strictly after the colliding record
            let retry_stamp = self.clock.now_millis().max(first_stamp.saturating_add(1));
            outcome = self.store.try_acquire(&self.key, &budget, permits, retry_stamp).await;
        }

        match outcome {
            Ok(AcquireOutcome::Granted) => {
                self.emit(LimiterEvent::Granted { key: self.key.clone(), permits }).await;
                true
            }
            Ok(AcquireOutcome::Exhausted) => {
                debug!(
                    target: "tallygate::rate_limit",
                    limiter = %self.key.limiter_id,
                    scope = self.key.scope,
                    subject = self.key.subject,
                    permits,
                    "budget exhausted"
                );
                self.deny(permits, DenyReason::BudgetExhausted).await
            }
            Ok(AcquireOutcome::Collision) => {
                warn!(
                    target: "tallygate::rate_limit",
                    limiter = %self.key.limiter_id,
                    scope = self.key.scope,
                    subject = self.key.subject,
                    "permit timestamp collided again after retry"
                );
                self.deny(permits, DenyReason::Contention).await
            }
            Err(e) => {
                error!(
                    target: "tallygate::rate_limit",
                    limiter = %self.key.limiter_id,
                    scope = self.key.scope,
                    subject = self.key.subject,
                    error = %e,
                    "permit store failed; denying"
                );
                self.deny(permits, DenyReason::StoreUnavailable).await
            }
        }
    }
}

/// Creates limiters that share one store and clock.
///
/// Construct one per store and pass it to whoever needs limiters; there is no
/// process-wide instance.
pub struct RateLimiterFactory<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for RateLimiterFactory<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), clock: self.clock.clone() }
    }
}

impl<S> RateLimiterFactory<S>
where
    S: PermitStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self { store: Arc::new(store), clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Limiter for `limiter_id` scoped to one subject.
    pub fn create(
        &self,
        limiter_id: impl Into<String>,
        budget: Budget,
        scope: i32,
        subject: i32,
    ) -> PermitLimiter<S> {
        PermitLimiter::new(self.store.clone(), LimiterKey::new(scope, subject, limiter_id), budget)
            .with_clock(self.clock.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::rate_limit::store::InMemoryPermitStore;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store that replays scripted outcomes and records the stamps it saw.
    #[derive(Default)]
    struct ScriptedStore {
        script: std::sync::Mutex<Vec<Result<AcquireOutcome, StoreError>>>,
        stamps: std::sync::Mutex<Vec<u64>>,
        calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(mut script: Vec<Result<AcquireOutcome, StoreError>>) -> Self {
            script.reverse();
            Self { script: std::sync::Mutex::new(script), ..Default::default() }
        }
    }

    #[async_trait]
    impl PermitStore for ScriptedStore {
        type Error = StoreError;

        async fn try_acquire(
            &self,
            _key: &LimiterKey,
            _budget: &Budget,
            _permits: u64,
            now_millis: u64,
        ) -> Result<AcquireOutcome, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stamps.lock().unwrap().push(now_millis);
            self.script.lock().unwrap().pop().unwrap_or(Ok(AcquireOutcome::Granted))
        }

        async fn live_permits(&self, _: &LimiterKey, _: Duration, _: u64) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn key() -> LimiterKey {
        LimiterKey::new(1, 100, "api")
    }

    #[tokio::test]
    async fn collision_is_retried_once_with_later_stamp() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(AcquireOutcome::Collision)]));
        let clock = ManualClock::new(5_000);
        let limiter = PermitLimiter::new(store.clone(), key(), Budget::new(10, Duration::from_secs(1)))
            .with_clock(Arc::new(clock));

        assert!(limiter.acquire().await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*store.stamps.lock().unwrap(), vec![5_000, 5_001]);
    }

    #[tokio::test]
    async fn second_collision_denies_without_further_retry() {
        let store = Arc::new(ScriptedStore::new(vec![
            Ok(AcquireOutcome::Collision),
            Ok(AcquireOutcome::Collision),
        ]));
        let sink = MemorySink::new();
        let limiter = PermitLimiter::new(store.clone(), key(), Budget::new(10, Duration::from_secs(1)))
            .with_sink(sink.clone());

        assert!(!limiter.acquire().await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            sink.events(),
            vec![LimiterEvent::Denied { key: key(), permits: 1, reason: DenyReason::Contention }]
        );
    }

    #[tokio::test]
    async fn store_error_fails_closed() {
        let store = Arc::new(ScriptedStore::new(vec![Err(StoreError::Poisoned)]));
        let sink = MemorySink::new();
        let limiter = PermitLimiter::new(store.clone(), key(), Budget::new(10, Duration::from_secs(1)))
            .with_sink(sink.clone());

        assert!(!limiter.acquire_permits(3).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.events(),
            vec![LimiterEvent::Denied { key: key(), permits: 3, reason: DenyReason::StoreUnavailable }]
        );
    }

    #[tokio::test]
    async fn oversized_and_zero_requests_skip_the_store() {
        let store = Arc::new(ScriptedStore::new(vec![]));
        let limiter = PermitLimiter::new(store.clone(), key(), Budget::new(4, Duration::from_secs(1)));

        assert!(!limiter.acquire_permits(5).await);
        assert!(limiter.acquire_permits(0).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn budget_swap_applies_to_next_acquire() {
        let store = Arc::new(InMemoryPermitStore::new());
        let clock = ManualClock::new(1_000);
        let limiter = PermitLimiter::new(store, key(), Budget::new(1, Duration::from_secs(60)))
            .with_clock(Arc::new(clock.clone()));

        assert!(limiter.acquire().await);
        clock.advance(Duration::from_millis(1));
        assert!(!limiter.acquire().await);

        let previous = limiter.set_budget(Budget::new(3, Duration::from_secs(60)));
        assert_eq!(previous.amount(), 1);
        clock.advance(Duration::from_millis(1));
        assert!(limiter.acquire_permits(2).await);
        assert_eq!(limiter.live_permits().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn factory_limiters_share_the_store() {
        let clock = ManualClock::new(10_000);
        let factory = RateLimiterFactory::new(InMemoryPermitStore::new()).with_clock(Arc::new(clock.clone()));
        let budget = Budget::new(2, Duration::from_secs(60));

        let first = factory.create("upload", budget, 3, 9);
        let second = factory.create("upload", budget, 3, 9);
        assert_eq!(first.id(), "upload");

        assert!(first.acquire().await);
        clock.advance(Duration::from_millis(1));
        assert!(second.acquire().await);
        clock.advance(Duration::from_millis(1));
        assert!(!first.acquire().await, "both handles draw from one budget");
    }
}
