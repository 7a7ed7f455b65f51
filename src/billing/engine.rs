//! The engine facade the host application constructs once at start-up.

use super::clock::{Clock, SystemClock};
use super::consumer::{ConsumptionResult, CreditConsumer, DEFAULT_MAX_UNITS_PER_CALL};
use super::entitlement::{AvailabilityResult, EntitlementChecker};
use super::error::{BillingError, StoreError};
use super::feature::{Feature, FreeTierPolicy, PoolTarget, SubscriptionStatus, SubscriptionTier};
use super::ledger::{default_allotments, Account, FreeAllotments};
use super::memory::InMemoryLedgerStore;
use super::reset::MonthlyReset;
use super::sqlite::SqliteLedgerStore;
use super::store::{LedgerStore, UsageLog};
use super::usage::{UsageMetadata, UsageRecord, UsageSummary};
use crate::config::{StorageBackend, StorageConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Engine tunables, usually taken from the config file.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: FreeTierPolicy,
    pub allotments: FreeAllotments,
    pub max_units_per_call: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: FreeTierPolicy::Enforced,
            allotments: default_allotments(),
            max_units_per_call: DEFAULT_MAX_UNITS_PER_CALL,
        }
    }
}

/// Account balances as shown to the account holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditSummary {
    pub account_id: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub unlimited_access: bool,
    pub free_tier_policy: FreeTierPolicy,
    pub free_counters: BTreeMap<Feature, u64>,
    pub paid_balances: BTreeMap<Feature, u64>,
    pub general_tokens: u64,
    pub last_free_reset: DateTime<Utc>,
}

/// Open the ledger store and usage log for a storage config.
pub fn open_store(
    config: &StorageConfig,
) -> Result<(Arc<dyn LedgerStore>, Arc<dyn UsageLog>), StoreError> {
    match config.backend {
        StorageBackend::Sqlite => {
            let path = config.resolved_path();
            let store = Arc::new(SqliteLedgerStore::open(
                &path,
                config.pool_size,
                Duration::from_millis(config.busy_timeout_ms),
            )?);
            tracing::info!(
                path = %path.display(),
                pool_size = config.pool_size,
                "Opened SQLite ledger"
            );
            let ledger: Arc<dyn LedgerStore> = store.clone();
            let usage: Arc<dyn UsageLog> = store;
            Ok((ledger, usage))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory ledger; balances are lost on exit");
            let store = Arc::new(InMemoryLedgerStore::new());
            let ledger: Arc<dyn LedgerStore> = store.clone();
            let usage: Arc<dyn UsageLog> = store;
            Ok((ledger, usage))
        }
    }
}

pub struct CreditEngine {
    store: Arc<dyn LedgerStore>,
    usage: Arc<dyn UsageLog>,
    checker: Arc<EntitlementChecker>,
    consumer: CreditConsumer,
}

impl CreditEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        usage: Arc<dyn UsageLog>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let reset = MonthlyReset::new(Arc::clone(&store), settings.allotments);
        let checker = Arc::new(EntitlementChecker::new(
            Arc::clone(&store),
            clock,
            reset,
            settings.policy,
        ));
        let consumer = CreditConsumer::new(
            Arc::clone(&checker),
            Arc::clone(&usage),
            settings.max_units_per_call,
        );
        Self {
            store,
            usage,
            checker,
            consumer,
        }
    }

    /// Engine over the wall clock.
    pub fn with_system_clock(
        store: Arc<dyn LedgerStore>,
        usage: Arc<dyn UsageLog>,
        settings: EngineSettings,
    ) -> Self {
        Self::new(store, usage, Arc::new(SystemClock), settings)
    }

    pub fn check_availability(
        &self,
        account_id: &str,
        feature: Feature,
    ) -> Result<AvailabilityResult, BillingError> {
        self.checker.check_availability(account_id, feature)
    }

    pub fn consume(
        &self,
        account_id: &str,
        feature: Feature,
        units: u64,
        metadata: Option<UsageMetadata>,
    ) -> Result<ConsumptionResult, BillingError> {
        self.consumer.consume(account_id, feature, units, metadata)
    }

    pub fn max_units_per_call(&self) -> u64 {
        self.consumer.max_units()
    }

    /// Add purchased credits. Returns the pool's new balance.
    ///
    /// Free counters are not purchasable.
    pub fn add_credits(
        &self,
        account_id: &str,
        target: PoolTarget,
        amount: u64,
    ) -> Result<u64, BillingError> {
        if matches!(target, PoolTarget::Free(_)) {
            return Err(BillingError::InvalidPool);
        }
        if amount == 0 {
            return Err(BillingError::InvalidAmount);
        }
        self.checker.require_account(account_id)?;

        let balance = match self.store.credit(account_id, target, amount) {
            Err(StoreError::LedgerUninitialized(_)) => {
                self.checker.current_ledger(account_id)?;
                self.store.credit(account_id, target, amount)?
            }
            other => other?,
        };
        tracing::info!(
            account_id,
            pool = %target.kind(),
            amount,
            balance,
            "Credits added"
        );
        Ok(balance)
    }

    /// Current balances, after lazy creation and monthly reset.
    pub fn balance(&self, account_id: &str) -> Result<CreditSummary, BillingError> {
        let account = self.checker.require_account(account_id)?;
        let ledger = self.checker.current_ledger(account_id)?;
        Ok(CreditSummary {
            unlimited_access: account.has_unlimited_access(),
            account_id: account.id,
            tier: account.tier,
            status: account.status,
            free_tier_policy: self.checker.policy(),
            free_counters: ledger.free_counters,
            paid_balances: ledger.paid_balances,
            general_tokens: ledger.general_tokens,
            last_free_reset: ledger.last_free_reset,
        })
    }

    pub fn recent_usage(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, BillingError> {
        Ok(self.usage.recent(account_id, limit)?)
    }

    pub fn usage_summary(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, BillingError> {
        Ok(self.usage.summary(account_id, since)?)
    }

    pub fn account(&self, account_id: &str) -> Result<Option<Account>, BillingError> {
        Ok(self.store.account(account_id)?)
    }

    /// Record subscription state pushed by the identity system.
    pub fn upsert_account(&self, account: &Account) -> Result<(), BillingError> {
        self.store.upsert_account(account)?;
        tracing::info!(
            account_id = %account.id,
            tier = account.tier.as_str(),
            status = account.status.as_str(),
            "Account updated"
        );
        Ok(())
    }

    /// Delete an account and its ledger. Usage history stays.
    pub fn delete_account(&self, account_id: &str) -> Result<bool, BillingError> {
        let removed = self.store.delete_account(account_id)?;
        if removed {
            tracing::info!(account_id, "Account deleted");
        }
        Ok(removed)
    }

    pub fn backend(&self) -> &str {
        self.store.name()
    }
}
