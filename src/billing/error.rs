//! Error types for the billing engine.

use thiserror::Error;

/// Failures raised by a ledger store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("ledger directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("usage metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    /// The account has no ledger yet. Recovered by lazy creation.
    #[error("ledger not initialized for account '{0}'")]
    LedgerUninitialized(String),

    #[error("account '{0}' not found")]
    AccountNotFound(String),
}

/// Errors surfaced to callers of the engine.
///
/// Running out of credits is never an error: availability returns
/// `allowed = false` and consumption returns a failed result.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("units must be between 1 and {max}, got {units}")]
    InvalidUnits { units: u64, max: u64 },

    #[error("credit amount must be positive")]
    InvalidAmount,

    #[error("free-tier allotments cannot be purchased")]
    InvalidPool,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_account_maps_to_billing_error() {
        let err: BillingError = StoreError::AccountNotFound("acct_1".into()).into();
        assert!(matches!(err, BillingError::AccountNotFound(ref id) if id == "acct_1"));
    }

    #[test]
    fn other_store_errors_stay_wrapped() {
        let err: BillingError = StoreError::Corrupt("bad pool".into()).into();
        assert!(matches!(err, BillingError::Store(StoreError::Corrupt(_))));
        assert!(err.to_string().contains("bad pool"));
    }
}
