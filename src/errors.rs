// =============================================================================
// Typed error kinds shared across the supervisor
// =============================================================================
//
// Risk rejections, MFA outcomes, and kill-switch refusals are NOT errors —
// they are ordinary result values (see `pipeline::ExecOutcome`). The kinds
// here are genuine faults: storage unavailability and brokerage failures.
// Only the HTTP adapter translates kinds into status codes.
// =============================================================================

use thiserror::Error;

/// Persistence gateway faults.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The gateway is in degraded mode; the watchdog is retrying.
    #[error("persistence unavailable")]
    NotConnected,

    /// A compare-and-set precondition failed (e.g. approval already in a
    /// terminal status).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying driver fault; callers may treat this as retryable.
    #[error("storage I/O: {0}")]
    Io(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True for kinds the caller may retry (degraded mode, driver faults).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Io(_))
    }
}

/// Brokerage capability faults.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Timeouts, 5xx, connection resets. The current tick is skipped; no
    /// state is mutated.
    #[error("brokerage transient: {0}")]
    Transient(String),

    /// Auth failures, rejected orders, 4xx. Surfaced to the caller and
    /// recorded in the audit trail; never triggers the kill switch by
    /// itself.
    #[error("brokerage permanent: {0}")]
    Permanent(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_transient_classification() {
        assert!(StoreError::NotConnected.is_transient());
        assert!(!StoreError::Conflict("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn broker_transient_classification() {
        assert!(BrokerError::Transient("timeout".into()).is_transient());
        assert!(!BrokerError::Permanent("401".into()).is_transient());
    }
}
