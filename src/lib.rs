#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tallygate
//!
//! Admission control that holds across a cluster, and the tag language used
//! to decide which rules apply to whom.
//!
//! ## Features
//!
//! - **Permit limiters** counting grants over a trailing window in a shared
//!   SQL table (SQLite or PostgreSQL via `sqlx`), failing closed when the
//!   store is unavailable
//! - **Tag expressions** (`a & !(b | c)`) parsed once and evaluated against
//!   tag sets
//! - **Context sets**: configuration overlays guarded by tag expressions
//! - **Tower middleware**, a limiter registry with change notifications, and
//!   structured telemetry events
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tallygate::rate_limit::store::InMemoryPermitStore;
//! use tallygate::{Budget, RateLimiter, RateLimiterFactory};
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = RateLimiterFactory::new(InMemoryPermitStore::new());
//!     let login = factory.create("login", Budget::new(5, Duration::from_secs(60)), 1, 42);
//!
//!     if login.acquire().await {
//!         // proceed
//!     }
//! }
//! ```

pub mod clock;
pub mod config;
pub mod context_sets;
pub mod error;
pub mod rate_limit;
pub mod tag_expr;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DynamicConfig, LimiterSettings};
pub use context_sets::{ConfigError, ContextSet, ContextSets};
pub use error::{GateError, StoreError};
pub use rate_limit::{
    Budget, LimiterKey, PermitLimiter, RateLimitLayer, RateLimiter, RateLimiterFactory,
};
pub use tag_expr::{ParseError, TagSet, Term};
