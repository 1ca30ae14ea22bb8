//! Registry of named limiters.
//!
//! Components that come and go at runtime register their limiters here;
//! interested parties subscribe to the change feed instead of polling.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::warn;

use crate::rate_limit::RateLimiter;

/// Change notification published by a [`LimiterRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { id: String },
    /// An existing id was re-registered; the new limiter replaced the old one.
    Replaced { id: String },
    Unregistered { id: String },
}

/// Trait for limiter registries (injectable wherever limiters are looked up).
pub trait LimiterRegistry: Send + Sync + fmt::Debug {
    /// Register a limiter by id, replacing any existing one.
    fn register(&self, id: String, limiter: Arc<dyn RateLimiter>);
    /// Remove a limiter, returning it if it was present.
    fn unregister(&self, id: &str) -> Option<Arc<dyn RateLimiter>>;
    fn get(&self, id: &str) -> Option<Arc<dyn RateLimiter>>;
    /// Registered ids, sorted.
    fn ids(&self) -> Vec<String>;
    /// Subscribe to registration changes from this point on.
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// In-memory implementation backed by an RwLock and a broadcast channel.
#[derive(Clone)]
pub struct InMemoryLimiterRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn RateLimiter>>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl InMemoryLimiterRegistry {
    /// `capacity` bounds how many unread events a slow subscriber may lag.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { inner: Arc::new(RwLock::new(HashMap::new())), events }
    }

    fn publish(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryLimiterRegistry {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl fmt::Debug for InMemoryLimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLimiterRegistry").field("ids", &self.ids()).finish()
    }
}

impl LimiterRegistry for InMemoryLimiterRegistry {
    fn register(&self, id: String, limiter: Arc<dyn RateLimiter>) {
        let replaced = {
            let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
            map.insert(id.clone(), limiter).is_some()
        };
        if replaced {
            warn!(target: "tallygate::registry", id = %id, "limiter id replaced; last registration wins");
            self.publish(RegistryEvent::Replaced { id });
        } else {
            self.publish(RegistryEvent::Registered { id });
        }
    }

    fn unregister(&self, id: &str) -> Option<Arc<dyn RateLimiter>> {
        let removed = {
            let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
            map.remove(id)
        };
        if removed.is_some() {
            self.publish(RegistryEvent::Unregistered { id: id.to_string() });
        }
        removed
    }

    fn get(&self, id: &str) -> Option<Arc<dyn RateLimiter>> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        map.get(id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
