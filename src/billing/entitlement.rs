//! Entitlement Checker: read-path evaluation of which pool would pay.
//!
//! Priority is fixed: an active paid subscription, then the feature's free
//! counter, then its purchased credits, then general tokens. The result is
//! advisory; the consumer re-runs the same selection at commit time.

use super::clock::Clock;
use super::error::{BillingError, StoreError};
use super::feature::{Feature, FreeTierPolicy, PoolKind, PoolTarget};
use super::ledger::{Account, CreditLedger, Period, Remaining};
use super::reset::MonthlyReset;
use super::store::LedgerStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// User-facing denial text. Never names pools or race details.
pub const NO_CREDITS_MESSAGE: &str =
    "No credits available for this feature. Upgrade or purchase credits to continue.";

/// Outcome of [`EntitlementChecker::check_availability`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityResult {
    pub allowed: bool,
    pub feature: Feature,
    pub paying_pool: Option<PoolKind>,
    pub remaining: Remaining,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
}

/// Which source covers a request, as seen on one ledger snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    Subscription,
    /// Free tier under the `unlimited` policy; counters are not touched.
    UnlimitedFree,
    Pool {
        target: PoolTarget,
        balance: u64,
        /// Period the free counters belonged to when read.
        period: Period,
    },
    Unavailable,
}

impl Selection {
    /// The paying pool and what it has left, or `None` when nothing covers.
    pub(crate) fn covered(self) -> Option<(PoolKind, Remaining)> {
        match self {
            Self::Subscription => Some((PoolKind::Subscription, Remaining::Unbounded)),
            Self::UnlimitedFree => Some((PoolKind::Free, Remaining::Unbounded)),
            Self::Pool {
                target, balance, ..
            } => Some((target.kind(), Remaining::Limited(balance))),
            Self::Unavailable => None,
        }
    }
}

/// Pick the first ledger pool able to cover `units`.
pub(crate) fn select_pool(ledger: &CreditLedger, feature: Feature, units: u64) -> Selection {
    let period = ledger.period();
    [
        PoolTarget::Free(feature),
        PoolTarget::Paid(feature),
        PoolTarget::General,
    ]
    .into_iter()
    .map(|target| (target, ledger.balance(target)))
    .find(|&(_, balance)| balance >= units)
    .map_or(Selection::Unavailable, |(target, balance)| Selection::Pool {
        target,
        balance,
        period,
    })
}

/// Message shown when a pool covers the request.
pub(crate) fn allowed_message(feature: Feature, pool: PoolKind, remaining: Remaining) -> String {
    let name = feature.display_name();
    match (pool, remaining) {
        (PoolKind::Subscription, _) => "Included in your subscription".to_string(),
        (PoolKind::Free, Remaining::Unbounded) => format!("Free {name} is currently unlimited"),
        (PoolKind::Free, Remaining::Limited(1)) => {
            format!("1 free {name} use remaining this month")
        }
        (PoolKind::Free, Remaining::Limited(n)) => {
            format!("{n} free {name} uses remaining this month")
        }
        (PoolKind::Paid, Remaining::Limited(n)) => format!("{n} {name} credits remaining"),
        (PoolKind::General, Remaining::Limited(n)) => format!("{n} general credits remaining"),
        (_, Remaining::Unbounded) => format!("Unlimited {name}"),
    }
}

/// Read-only evaluator over the ledger store.
pub struct EntitlementChecker {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    reset: MonthlyReset,
    policy: FreeTierPolicy,
}

impl EntitlementChecker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        reset: MonthlyReset,
        policy: FreeTierPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            reset,
            policy,
        }
    }

    pub fn policy(&self) -> FreeTierPolicy {
        self.policy
    }

    pub(crate) fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Decide whether one unit of `feature` is currently allowed.
    ///
    /// Running out of credits is `allowed = false`, not an error.
    pub fn check_availability(
        &self,
        account_id: &str,
        feature: Feature,
    ) -> Result<AvailabilityResult, BillingError> {
        let selection = self.evaluate(account_id, feature, 1)?;
        let result = match selection.covered() {
            Some((pool, remaining)) => AvailabilityResult {
                allowed: true,
                feature,
                paying_pool: Some(pool),
                remaining,
                reason: None,
                message: allowed_message(feature, pool, remaining),
            },
            None => AvailabilityResult {
                allowed: false,
                feature,
                paying_pool: None,
                remaining: Remaining::Limited(0),
                reason: Some("no credits available".to_string()),
                message: NO_CREDITS_MESSAGE.to_string(),
            },
        };

        tracing::debug!(
            account_id,
            feature = %feature,
            allowed = result.allowed,
            pool = ?result.paying_pool,
            "Availability checked"
        );
        Ok(result)
    }

    /// Run the priority selection for `units` against current state.
    pub(crate) fn evaluate(
        &self,
        account_id: &str,
        feature: Feature,
        units: u64,
    ) -> Result<Selection, StoreError> {
        let account = self.require_account(account_id)?;
        if account.has_unlimited_access() {
            return Ok(Selection::Subscription);
        }
        if self.policy == FreeTierPolicy::Unlimited && self.reset.allotments().contains_key(&feature)
        {
            return Ok(Selection::UnlimitedFree);
        }
        let ledger = self.current_ledger(account_id)?;
        Ok(select_pool(&ledger, feature, units))
    }

    pub(crate) fn require_account(&self, account_id: &str) -> Result<Account, StoreError> {
        self.store
            .account(account_id)?
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))
    }

    /// Load the ledger, creating it if absent and resetting a stale month.
    pub(crate) fn current_ledger(&self, account_id: &str) -> Result<CreditLedger, StoreError> {
        let now = self.clock.now();
        let ledger = match self.store.ledger(account_id)? {
            Some(ledger) => ledger,
            None => {
                let ledger = self
                    .store
                    .create_ledger(account_id, self.reset.allotments(), now)?;
                tracing::info!(
                    account_id,
                    backend = self.store.name(),
                    "Credit ledger initialized"
                );
                ledger
            }
        };
        self.reset.apply(ledger, now)
    }
}
