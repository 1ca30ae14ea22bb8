//! Error types shared across limiters and stores.
use std::fmt;

/// Failures raised by a [`PermitStore`](crate::rate_limit::store::PermitStore).
///
/// Limiters never hand these to their callers; they are logged and turned
/// into a denial.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backing database rejected a statement or the connection failed.
    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A value does not fit the signed 64-bit columns of the permit table.
    #[error("{field} value {value} exceeds the store's signed 64-bit range")]
    OutOfRange { field: &'static str, value: u64 },
    /// A stored value could not be read back as a permit count.
    #[error("corrupt permit row: {0}")]
    Corrupt(String),
    /// The in-process store lock was poisoned by a panicking holder.
    #[error("permit store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Convert an unsigned quantity to the store's `BIGINT` column type.
    pub fn to_column(field: &'static str, value: u64) -> Result<i64, StoreError> {
        i64::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
    }
}

/// Error returned by [`RateLimitService`](crate::rate_limit::RateLimitService).
#[derive(Debug, Clone, PartialEq)]
pub enum GateError<E> {
    /// The limiter denied the request.
    RateLimited { limiter: String },
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { limiter } => write!(f, "rate limit '{}' exceeded", limiter),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> GateError<E> {
    /// Check if the request was turned away by the limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}
