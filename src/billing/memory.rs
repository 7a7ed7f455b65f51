//! In-process ledger store.
//!
//! Each account's ledger sits behind its own mutex, so mutations for one
//! account are serialized while different accounts proceed in parallel.

use super::error::StoreError;
use super::feature::PoolTarget;
use super::ledger::{Account, CreditLedger, FreeAllotments, Period};
use super::store::{DebitOutcome, LedgerStore, UsageLog};
use super::usage::{UsageRecord, UsageSummary};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct InMemoryLedgerStore {
    accounts: RwLock<HashMap<String, Account>>,
    ledgers: RwLock<HashMap<String, Arc<Mutex<CreditLedger>>>>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, account_id: &str) -> Option<Arc<Mutex<CreditLedger>>> {
        self.ledgers.read().get(account_id).cloned()
    }

    fn require_slot(&self, account_id: &str) -> Result<Arc<Mutex<CreditLedger>>, StoreError> {
        self.slot(account_id)
            .ok_or_else(|| StoreError::LedgerUninitialized(account_id.to_string()))
    }

    /// Number of usage records held.
    pub fn usage_len(&self) -> usize {
        self.usage.lock().len()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().get(account_id).cloned())
    }

    fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts
            .write()
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn delete_account(&self, account_id: &str) -> Result<bool, StoreError> {
        // Lock order: accounts, then ledgers.
        let mut accounts = self.accounts.write();
        let removed = accounts.remove(account_id).is_some();
        self.ledgers.write().remove(account_id);
        Ok(removed)
    }

    fn ledger(&self, account_id: &str) -> Result<Option<CreditLedger>, StoreError> {
        Ok(self.slot(account_id).map(|slot| slot.lock().clone()))
    }

    fn create_ledger(
        &self,
        account_id: &str,
        allotments: &FreeAllotments,
        now: DateTime<Utc>,
    ) -> Result<CreditLedger, StoreError> {
        // Held until the ledger is inserted so a concurrent delete cannot
        // leave an orphan behind.
        let accounts = self.accounts.read();
        if !accounts.contains_key(account_id) {
            return Err(StoreError::AccountNotFound(account_id.to_string()));
        }
        let slot = Arc::clone(
            self.ledgers
                .write()
                .entry(account_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(CreditLedger::new(account_id, allotments, now)))
                }),
        );
        drop(accounts);
        let ledger = slot.lock().clone();
        Ok(ledger)
    }

    fn reset_free_tier(
        &self,
        account_id: &str,
        current: Period,
        allotments: &FreeAllotments,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let slot = self.require_slot(account_id)?;
        let mut ledger = slot.lock();
        if ledger.period() >= current {
            return Ok(false);
        }
        ledger.free_counters = allotments.clone();
        ledger.last_free_reset = now;
        Ok(true)
    }

    fn debit(
        &self,
        account_id: &str,
        target: PoolTarget,
        units: u64,
        period: Period,
    ) -> Result<DebitOutcome, StoreError> {
        let slot = self.require_slot(account_id)?;
        let mut ledger = slot.lock();
        if matches!(target, PoolTarget::Free(_)) && ledger.period() != period {
            return Ok(DebitOutcome::Rejected);
        }
        Ok(match ledger.try_debit(target, units) {
            Some(remaining) => DebitOutcome::Applied { remaining },
            None => DebitOutcome::Rejected,
        })
    }

    fn credit(&self, account_id: &str, target: PoolTarget, amount: u64) -> Result<u64, StoreError> {
        let slot = self.require_slot(account_id)?;
        let mut ledger = slot.lock();
        Ok(ledger.add(target, amount))
    }
}

impl UsageLog for InMemoryLedgerStore {
    fn append(&self, record: &UsageRecord) -> Result<i64, StoreError> {
        let mut usage = self.usage.lock();
        let id = i64::try_from(usage.len()).unwrap_or(i64::MAX - 1) + 1;
        let mut stored = record.clone();
        stored.id = id;
        usage.push(stored);
        Ok(id)
    }

    fn recent(&self, account_id: &str, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        let usage = self.usage.lock();
        Ok(usage
            .iter()
            .rev()
            .filter(|r| r.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn summary(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, StoreError> {
        let records: Vec<UsageRecord> = self
            .usage
            .lock()
            .iter()
            .filter(|r| r.account_id == account_id)
            .filter(|r| since.is_none_or(|s| r.timestamp >= s))
            .cloned()
            .collect();
        Ok(UsageSummary::from_records(account_id, since, &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::feature::Feature;
    use crate::billing::ledger::default_allotments;
    use chrono::TimeZone;

    fn jan() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
    }

    fn store_with_account(id: &str) -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        store.upsert_account(&Account::new(id)).unwrap();
        store
    }

    #[test]
    fn create_ledger_requires_account() {
        let store = InMemoryLedgerStore::new();
        let err = store
            .create_ledger("ghost", &default_allotments(), jan())
            .unwrap_err();
        assert!(matches!(err, StoreError::AccountNotFound(_)));
    }

    #[test]
    fn create_ledger_is_idempotent() {
        let store = store_with_account("acct");
        let first = store.create_ledger("acct", &default_allotments(), jan()).unwrap();
        store.credit("acct", PoolTarget::General, 7).unwrap();
        let second = store.create_ledger("acct", &default_allotments(), jan()).unwrap();
        assert_eq!(first.general_tokens, 0);
        assert_eq!(second.general_tokens, 7);
    }

    #[test]
    fn debit_without_ledger_is_uninitialized() {
        let store = store_with_account("acct");
        let err = store
            .debit("acct", PoolTarget::General, 1, Period::of(jan()))
            .unwrap_err();
        assert!(matches!(err, StoreError::LedgerUninitialized(_)));
    }

    #[test]
    fn free_debit_rejected_for_other_period() {
        let store = store_with_account("acct");
        store.create_ledger("acct", &default_allotments(), jan()).unwrap();
        let feb = Period { year: 2026, month: 2 };
        let outcome = store
            .debit("acct", PoolTarget::Free(Feature::BackgroundRemoval), 1, feb)
            .unwrap();
        assert_eq!(outcome, DebitOutcome::Rejected);
        let outcome = store
            .debit("acct", PoolTarget::Free(Feature::BackgroundRemoval), 1, Period::of(jan()))
            .unwrap();
        assert_eq!(outcome, DebitOutcome::Applied { remaining: 4 });
    }

    #[test]
    fn delete_account_drops_ledger_but_keeps_usage() {
        let store = store_with_account("acct");
        store.create_ledger("acct", &default_allotments(), jan()).unwrap();
        store
            .append(&UsageRecord {
                id: 0,
                account_id: "acct".into(),
                feature: Feature::ImageUpscale,
                units: 1,
                pool: None,
                success: false,
                error: Some("InsufficientCredits".into()),
                metadata: None,
                timestamp: jan(),
            })
            .unwrap();

        assert!(store.delete_account("acct").unwrap());
        assert!(store.ledger("acct").unwrap().is_none());
        assert_eq!(store.recent("acct", 10).unwrap().len(), 1);
    }

    #[test]
    fn recreated_account_starts_with_fresh_ledger() {
        let store = store_with_account("acct");
        store.create_ledger("acct", &default_allotments(), jan()).unwrap();
        store.credit("acct", PoolTarget::General, 9).unwrap();
        store
            .debit("acct", PoolTarget::Free(Feature::ImageUpscale), 3, Period::of(jan()))
            .unwrap();
        assert!(store.delete_account("acct").unwrap());

        store.upsert_account(&Account::new("acct")).unwrap();
        let ledger = store.create_ledger("acct", &default_allotments(), jan()).unwrap();
        assert_eq!(ledger.general_tokens, 0);
        assert!(ledger.paid_balances.values().all(|&b| b == 0));
        assert_eq!(ledger.free_counters, default_allotments());
    }

    #[test]
    fn racing_create_and_delete_leave_no_orphan_ledger() {
        let store = InMemoryLedgerStore::new();
        for _ in 0..200 {
            store.upsert_account(&Account::new("acct")).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    let _ = store.create_ledger("acct", &default_allotments(), jan());
                });
                s.spawn(|| {
                    store.delete_account("acct").unwrap();
                });
            });
            assert!(store.account("acct").unwrap().is_none());
            assert!(store.ledger("acct").unwrap().is_none());
        }
    }
}
