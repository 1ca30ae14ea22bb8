use std::fmt;

use crate::rate_limit::LimiterKey;

/// Why a limiter turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The live permits plus the request would exceed the budget.
    BudgetExhausted,
    /// The request alone is larger than the whole budget.
    ExceedsBudget,
    /// The store kept reporting timestamp collisions after the retry.
    Contention,
    /// The store failed; the limiter failed closed.
    StoreUnavailable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DenyReason::BudgetExhausted => "budget_exhausted",
            DenyReason::ExceedsBudget => "exceeds_budget",
            DenyReason::Contention => "contention",
            DenyReason::StoreUnavailable => "store_unavailable",
        };
        f.write_str(label)
    }
}

/// Events emitted by permit limiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// Permits were recorded against the budget.
    Granted {
        key: LimiterKey,
        permits: u64,
    },
    /// The request was denied.
    Denied {
        key: LimiterKey,
        permits: u64,
        reason: DenyReason,
    },
}

impl LimiterEvent {
    pub fn key(&self) -> &LimiterKey {
        match self {
            LimiterEvent::Granted { key, .. } | LimiterEvent::Denied { key, .. } => key,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, LimiterEvent::Granted { .. })
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Granted { key, permits } => write!(f, "Granted({}, permits={})", key, permits),
            LimiterEvent::Denied { key, permits, reason } => {
                write!(f, "Denied({}, permits={}, reason={})", key, permits, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_key_and_reason() {
        let key = LimiterKey::new(7, 42, "login");
        let granted = LimiterEvent::Granted { key: key.clone(), permits: 2 };
        assert_eq!(granted.to_string(), "Granted(7/42/login, permits=2)");
        assert!(granted.is_granted());

        let denied = LimiterEvent::Denied { key, permits: 9, reason: DenyReason::ExceedsBudget };
        assert_eq!(denied.to_string(), "Denied(7/42/login, permits=9, reason=exceeds_budget)");
        assert_eq!(denied.key().limiter_id, "login");
    }
}
