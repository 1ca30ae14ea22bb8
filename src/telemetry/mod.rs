//! Telemetry for permit limiters.
//!
//! Limiters describe each decision as a [`LimiterEvent`]. Events flow through
//! [`TelemetrySink`] implementations, which are plain `tower::Service`s so they
//! compose with standard tower combinators.
//!
//! ```rust
//! use tallygate::telemetry::{DenyReason, LimiterEvent};
//! use tallygate::rate_limit::LimiterKey;
//!
//! let event = LimiterEvent::Denied {
//!     key: LimiterKey::new(1, 2, "login"),
//!     permits: 1,
//!     reason: DenyReason::BudgetExhausted,
//! };
//! assert!(!event.is_granted());
//! ```

pub mod events;
pub mod sinks;

pub use events::{DenyReason, LimiterEvent};
pub use sinks::{LogSink, MemorySink, NullSink};

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// A sink that is not ready or fails simply loses the event; limiter
/// decisions never depend on telemetry.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}
