//! Credit Consumer: the write path.
//!
//! Selection is re-run against fresh state and committed with one
//! conditional debit. A debit the store rejects is never retried against a
//! different pool: the caller gets a failed result and re-checks.

use super::entitlement::{allowed_message, EntitlementChecker, Selection, NO_CREDITS_MESSAGE};
use super::error::{BillingError, StoreError};
use super::feature::{Feature, PoolKind, PoolTarget};
use super::ledger::{Period, Remaining};
use super::store::{DebitOutcome, UsageLog};
use super::usage::{UsageMetadata, UsageRecord};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Default upper bound on units per consume call.
pub const DEFAULT_MAX_UNITS_PER_CALL: u64 = 10;

/// Why a consumption did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumeFailure {
    /// No pool could cover the units at commit time.
    InsufficientCredits,
    /// The selected balance changed under us; re-check before trying again.
    ConcurrentUpdateLost,
    AccountNotFound,
}

impl ConsumeFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientCredits => "InsufficientCredits",
            Self::ConcurrentUpdateLost => "ConcurrentUpdateLost",
            Self::AccountNotFound => "AccountNotFound",
        }
    }

    /// Message safe to show an end user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::InsufficientCredits | Self::ConcurrentUpdateLost => NO_CREDITS_MESSAGE,
            Self::AccountNotFound => "Account not found",
        }
    }
}

impl fmt::Display for ConsumeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`CreditConsumer::consume`]. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumptionResult {
    pub success: bool,
    pub feature: Feature,
    pub units: u64,
    pub paying_pool: Option<PoolKind>,
    pub remaining_after: Remaining,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ConsumeFailure>,
    /// Id of the usage record, when the audit write succeeded.
    pub usage_id: Option<i64>,
}

enum Settlement {
    Paid {
        pool: PoolKind,
        remaining: Remaining,
    },
    Failed(ConsumeFailure),
}

pub struct CreditConsumer {
    checker: Arc<EntitlementChecker>,
    usage: Arc<dyn UsageLog>,
    max_units: u64,
}

impl CreditConsumer {
    pub fn new(checker: Arc<EntitlementChecker>, usage: Arc<dyn UsageLog>, max_units: u64) -> Self {
        Self {
            checker,
            usage,
            max_units: max_units.max(1),
        }
    }

    pub fn max_units(&self) -> u64 {
        self.max_units
    }

    /// Consume `units` of `feature` for the account.
    ///
    /// Every call past argument validation appends exactly one usage record.
    /// `Err` is returned only for invalid units or a storage fault.
    pub fn consume(
        &self,
        account_id: &str,
        feature: Feature,
        units: u64,
        metadata: Option<UsageMetadata>,
    ) -> Result<ConsumptionResult, BillingError> {
        if units == 0 || units > self.max_units {
            return Err(BillingError::InvalidUnits {
                units,
                max: self.max_units,
            });
        }

        let settlement = match self.settle(account_id, feature, units) {
            Err(StoreError::LedgerUninitialized(_)) => {
                tracing::debug!(account_id, "Ledger missing at commit; retrying once");
                self.settle(account_id, feature, units)
            }
            other => other,
        };

        let settlement = match settlement {
            Ok(settlement) => settlement,
            Err(StoreError::LedgerUninitialized(_)) => {
                Settlement::Failed(ConsumeFailure::AccountNotFound)
            }
            Err(err) => {
                self.record(account_id, feature, units, None, Some("StorageError"), metadata);
                return Err(err.into());
            }
        };

        let result = match settlement {
            Settlement::Paid { pool, remaining } => {
                let usage_id = self.record(account_id, feature, units, Some(pool), None, metadata);
                tracing::info!(
                    account_id,
                    feature = %feature,
                    pool = %pool,
                    units,
                    "Credits consumed"
                );
                ConsumptionResult {
                    success: true,
                    feature,
                    units,
                    paying_pool: Some(pool),
                    remaining_after: remaining,
                    message: allowed_message(feature, pool, remaining),
                    failure: None,
                    usage_id,
                }
            }
            Settlement::Failed(failure) => {
                let usage_id = self.record(
                    account_id,
                    feature,
                    units,
                    None,
                    Some(failure.as_str()),
                    metadata,
                );
                tracing::debug!(
                    account_id,
                    feature = %feature,
                    units,
                    failure = %failure,
                    "Consumption denied"
                );
                ConsumptionResult {
                    success: false,
                    feature,
                    units,
                    paying_pool: None,
                    remaining_after: Remaining::Limited(0),
                    message: failure.user_message().to_string(),
                    failure: Some(failure),
                    usage_id,
                }
            }
        };
        Ok(result)
    }

    fn settle(
        &self,
        account_id: &str,
        feature: Feature,
        units: u64,
    ) -> Result<Settlement, StoreError> {
        let selection = match self.checker.evaluate(account_id, feature, units) {
            Err(StoreError::AccountNotFound(_)) => {
                return Ok(Settlement::Failed(ConsumeFailure::AccountNotFound))
            }
            other => other?,
        };

        match selection {
            Selection::Pool {
                target, period, ..
            } => self.commit(account_id, target, units, period),
            Selection::Unavailable => Ok(Settlement::Failed(ConsumeFailure::InsufficientCredits)),
            covered => Ok(match covered.covered() {
                Some((pool, remaining)) => Settlement::Paid { pool, remaining },
                None => Settlement::Failed(ConsumeFailure::InsufficientCredits),
            }),
        }
    }

    fn commit(
        &self,
        account_id: &str,
        target: PoolTarget,
        units: u64,
        period: Period,
    ) -> Result<Settlement, StoreError> {
        let store = self.checker.store();
        match store.debit(account_id, target, units, period)? {
            DebitOutcome::Applied { remaining } => Ok(Settlement::Paid {
                pool: target.kind(),
                remaining: Remaining::Limited(remaining),
            }),
            DebitOutcome::Rejected => {
                let ledger = store
                    .ledger(account_id)?
                    .ok_or_else(|| StoreError::LedgerUninitialized(account_id.to_string()))?;
                let failure = if ledger.balance(target) < units {
                    ConsumeFailure::InsufficientCredits
                } else {
                    ConsumeFailure::ConcurrentUpdateLost
                };
                tracing::warn!(
                    account_id,
                    pool = %target.kind(),
                    units,
                    failure = %failure,
                    "Conditional debit rejected"
                );
                Ok(Settlement::Failed(failure))
            }
        }
    }

    /// Append the audit record. A failed write is reported, never raised.
    fn record(
        &self,
        account_id: &str,
        feature: Feature,
        units: u64,
        pool: Option<PoolKind>,
        error: Option<&str>,
        metadata: Option<UsageMetadata>,
    ) -> Option<i64> {
        let record = UsageRecord {
            id: 0,
            account_id: account_id.to_string(),
            feature,
            units,
            pool,
            success: pool.is_some(),
            error: error.map(str::to_string),
            metadata,
            timestamp: self.checker.now(),
        };
        match self.usage.append(&record) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::error!(
                    account_id,
                    feature = %feature,
                    pool = ?pool,
                    units,
                    error = %err,
                    "Failed to write usage record"
                );
                None
            }
        }
    }
}
