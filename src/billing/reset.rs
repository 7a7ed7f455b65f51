//! Lazy monthly reset of free-tier counters.
//!
//! There is no scheduler: the first request in a new calendar month
//! restores the counters. The store-side reset is conditioned on the stored
//! period still being stale, so concurrent requests apply it exactly once.

use super::error::StoreError;
use super::ledger::{CreditLedger, FreeAllotments, Period};
use super::store::LedgerStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Whether the ledger's free counters belong to an earlier month than `now`.
pub fn is_stale(ledger: &CreditLedger, now: DateTime<Utc>) -> bool {
    ledger.period() < Period::of(now)
}

/// Pure reset: returns the ledger as it must look in the month of `now`.
///
/// Idempotent within a month. A ledger that is already current (or dated
/// ahead of `now`) comes back unchanged.
pub fn ensure_current_period(
    ledger: &CreditLedger,
    allotments: &FreeAllotments,
    now: DateTime<Utc>,
) -> CreditLedger {
    if !is_stale(ledger, now) {
        return ledger.clone();
    }
    CreditLedger {
        free_counters: allotments.clone(),
        last_free_reset: now,
        ..ledger.clone()
    }
}

/// Applies [`ensure_current_period`] against the store.
pub struct MonthlyReset {
    store: Arc<dyn LedgerStore>,
    allotments: FreeAllotments,
}

impl MonthlyReset {
    pub fn new(store: Arc<dyn LedgerStore>, allotments: FreeAllotments) -> Self {
        Self { store, allotments }
    }

    pub fn allotments(&self) -> &FreeAllotments {
        &self.allotments
    }

    /// Bring a freshly read ledger into the current period.
    ///
    /// Returns the stored ledger after the reset (whoever applied it).
    pub fn apply(&self, ledger: CreditLedger, now: DateTime<Utc>) -> Result<CreditLedger, StoreError> {
        let current = Period::of(now);
        let stored = ledger.period();

        if stored == current {
            return Ok(ledger);
        }
        if stored > current {
            tracing::warn!(
                account_id = %ledger.account_id,
                stored = ?stored,
                current = ?current,
                "Ledger reset date is ahead of the clock; keeping free counters"
            );
            return Ok(ledger);
        }

        let applied =
            self.store
                .reset_free_tier(&ledger.account_id, current, &self.allotments, now)?;
        if applied {
            tracing::info!(
                account_id = %ledger.account_id,
                year = current.year,
                month = current.month,
                "Free-tier counters reset for new month"
            );
        }

        self.store
            .ledger(&ledger.account_id)?
            .ok_or_else(|| StoreError::LedgerUninitialized(ledger.account_id.clone()))
    }
}
