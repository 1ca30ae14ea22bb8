use super::events::LimiterEvent;
use super::TelemetrySink;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// Discards every event. Default sink of a [`PermitLimiter`](crate::PermitLimiter).
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each decision as a structured `tracing` record under
/// `tallygate::telemetry`.
///
/// Grants are logged at `debug`, denials at `info`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match &event {
            LimiterEvent::Granted { key, permits } => tracing::debug!(
                target: "tallygate::telemetry",
                limiter = %key.limiter_id,
                scope = key.scope,
                subject = key.subject,
                permits,
                "permits granted"
            ),
            LimiterEvent::Denied { key, permits, reason } => tracing::info!(
                target: "tallygate::telemetry",
                limiter = %key.limiter_id,
                scope = key.scope,
                subject = key.subject,
                permits,
                reason = %reason,
                "permits denied"
            ),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent `capacity` events in memory.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the retained events, oldest first.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.events.lock().map(|g| g.iter().cloned().collect()).unwrap_or_default()
    }

    /// Number of retained denials.
    pub fn denials(&self) -> usize {
        self.events
            .lock()
            .map(|g| g.iter().filter(|e| !e.is_granted()).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        if let Ok(mut guard) = self.events.lock() {
            if guard.len() >= self.capacity {
                guard.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            guard.push_back(event);
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
