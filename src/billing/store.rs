//! Storage seams for the billing engine.
//!
//! The ledger store owns no policy. Every mutation it exposes is a single
//! conditional operation so that callers never need a read-then-write pair
//! to stay consistent under concurrent requests for the same account.

use super::error::StoreError;
use super::feature::PoolTarget;
use super::ledger::{Account, CreditLedger, FreeAllotments, Period};
use super::usage::{UsageRecord, UsageSummary};
use chrono::{DateTime, Utc};

/// Result of a conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// The balance covered the units and was decremented.
    Applied { remaining: u64 },
    /// The precondition no longer held at write time; nothing changed.
    Rejected,
}

/// Persisted accounts, subscription state and per-account balances.
pub trait LedgerStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    /// Insert or update an account's subscription state.
    fn upsert_account(&self, account: &Account) -> Result<(), StoreError>;

    /// Remove an account together with its ledger. Usage records are kept.
    fn delete_account(&self, account_id: &str) -> Result<bool, StoreError>;

    fn ledger(&self, account_id: &str) -> Result<Option<CreditLedger>, StoreError>;

    /// Create the account's ledger if absent and return the stored ledger.
    ///
    /// Idempotent: when two callers race, both observe the winner's row.
    /// Fails with `AccountNotFound` when the account does not exist.
    fn create_ledger(
        &self,
        account_id: &str,
        allotments: &FreeAllotments,
        now: DateTime<Utc>,
    ) -> Result<CreditLedger, StoreError>;

    /// Restore free counters to `allotments` if the stored reset period is
    /// older than `current`. Returns `true` only for the call that applied it.
    fn reset_free_tier(
        &self,
        account_id: &str,
        current: Period,
        allotments: &FreeAllotments,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Decrement `target` by `units` only if its balance is at least `units`.
    ///
    /// Free counters are additionally conditioned on the ledger still being in
    /// `period`, so a decrement can never land on counters a concurrent reset
    /// has just replaced.
    fn debit(
        &self,
        account_id: &str,
        target: PoolTarget,
        units: u64,
        period: Period,
    ) -> Result<DebitOutcome, StoreError>;

    /// Add `amount` to `target` and return the new balance.
    fn credit(&self, account_id: &str, target: PoolTarget, amount: u64) -> Result<u64, StoreError>;
}

/// Append-only record of consumption attempts.
pub trait UsageLog: Send + Sync {
    /// Persist a record and return its assigned id.
    fn append(&self, record: &UsageRecord) -> Result<i64, StoreError>;

    /// Most recent records for an account, newest first.
    fn recent(&self, account_id: &str, limit: usize) -> Result<Vec<UsageRecord>, StoreError>;

    fn summary(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, StoreError>;
}
