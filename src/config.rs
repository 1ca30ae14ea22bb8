//! Configuration handles for limiters.
//!
//! [`DynamicConfig`] holds values that may be swapped while limiters are in
//! use (budgets are re-read on every acquire). The default backend uses
//! `ArcSwap` for lock-free reads; feature `adaptive-rwlock` switches to an
//! `RwLock`.
//!
//! [`LimiterSettings`] is the serialisable shape of a limiter definition as it
//! appears in configuration files.

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

use serde::{Deserialize, Serialize};

use crate::rate_limit::Budget;

/// Shared, live-updatable configuration value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::new(guard.clone())
        }
    }

    /// Replace the value, returning the previous one.
    pub fn replace(&self, value: T) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.swap(Arc::new(value))
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::new(std::mem::replace(&mut *guard, value))
        }
    }
}

/// One limiter as declared in configuration.
///
/// ```json
/// { "id": "login", "amount": 5, "timeframe_ms": 60000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Limiter identifier, stored in the `id` column.
    pub id: String,
    /// Permits allowed per timeframe.
    pub amount: u64,
    /// Trailing window length in milliseconds.
    pub timeframe_ms: u64,
}

impl LimiterSettings {
    pub fn budget(&self) -> Budget {
        Budget::new(self.amount, Duration::from_millis(self.timeframe_ms))
    }

    /// Parse a JSON array of limiter definitions.
    pub fn list_from_json(raw: &str) -> Result<Vec<LimiterSettings>, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
