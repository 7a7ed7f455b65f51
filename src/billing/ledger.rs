//! Ledger data model: accounts, per-account balances and billing periods.

use super::feature::{Feature, PoolTarget, SubscriptionStatus, SubscriptionTier};
use chrono::{DateTime, Datelike, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Monthly free allotment per feature. Features without an entry have no free tier.
pub type FreeAllotments = BTreeMap<Feature, u64>;

/// Default monthly free allotments.
pub fn default_allotments() -> FreeAllotments {
    BTreeMap::from([(Feature::BackgroundRemoval, 5), (Feature::ImageUpscale, 3)])
}

/// An account as seen by the billing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Inactive,
        }
    }

    pub fn with_subscription(mut self, tier: SubscriptionTier, status: SubscriptionStatus) -> Self {
        self.tier = tier;
        self.status = status;
        self
    }

    /// Active `pro` or `enterprise` subscriptions grant unlimited usage.
    pub fn has_unlimited_access(&self) -> bool {
        self.status == SubscriptionStatus::Active
            && matches!(self.tier, SubscriptionTier::Pro | SubscriptionTier::Enterprise)
    }
}

/// Calendar month used for free-tier resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Period {
    pub year: i32,
    /// 1-based month.
    pub month: u32,
}

impl Period {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Months since year 0; monotonic and suitable for SQL comparisons.
    pub fn index(self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    pub fn from_index(index: i64) -> Self {
        let year = index.div_euclid(12);
        let month = index.rem_euclid(12) + 1;
        Self {
            year: i32::try_from(year).unwrap_or(i32::MAX),
            month: u32::try_from(month).unwrap_or(1),
        }
    }
}

/// Per-account balances. Exactly one exists per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditLedger {
    pub account_id: String,
    /// Free uses left this period, only for features with an allotment.
    pub free_counters: BTreeMap<Feature, u64>,
    /// Purchased feature-specific credits.
    pub paid_balances: BTreeMap<Feature, u64>,
    pub general_tokens: u64,
    pub last_free_reset: DateTime<Utc>,
}

impl CreditLedger {
    /// A fresh ledger with free counters at their default allotment.
    pub fn new(account_id: impl Into<String>, allotments: &FreeAllotments, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            free_counters: allotments.clone(),
            paid_balances: BTreeMap::new(),
            general_tokens: 0,
            last_free_reset: now,
        }
    }

    pub fn period(&self) -> Period {
        Period::of(self.last_free_reset)
    }

    /// Current balance of a target; absent entries read as zero.
    pub fn balance(&self, target: PoolTarget) -> u64 {
        match target {
            PoolTarget::Free(feature) => self.free_counters.get(&feature).copied().unwrap_or(0),
            PoolTarget::Paid(feature) => self.paid_balances.get(&feature).copied().unwrap_or(0),
            PoolTarget::General => self.general_tokens,
        }
    }

    /// Whether the feature has a free-tier counter this period.
    pub fn has_free_tier(&self, feature: Feature) -> bool {
        self.free_counters.contains_key(&feature)
    }

    /// Apply a checked decrement; `None` leaves the ledger untouched.
    pub(crate) fn try_debit(&mut self, target: PoolTarget, units: u64) -> Option<u64> {
        let slot = match target {
            PoolTarget::Free(feature) => self.free_counters.get_mut(&feature)?,
            PoolTarget::Paid(feature) => self.paid_balances.get_mut(&feature)?,
            PoolTarget::General => &mut self.general_tokens,
        };
        let remaining = slot.checked_sub(units)?;
        *slot = remaining;
        Some(remaining)
    }

    /// Additive update; saturates rather than wrapping.
    pub(crate) fn add(&mut self, target: PoolTarget, amount: u64) -> u64 {
        let slot = match target {
            PoolTarget::Free(feature) => self.free_counters.entry(feature).or_insert(0),
            PoolTarget::Paid(feature) => self.paid_balances.entry(feature).or_insert(0),
            PoolTarget::General => &mut self.general_tokens,
        };
        *slot = slot.saturating_add(amount);
        *slot
    }
}

/// Remaining usage in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Limited(u64),
    Unbounded,
}

impl Remaining {
    pub fn limited(self) -> Option<u64> {
        match self {
            Self::Limited(n) => Some(n),
            Self::Unbounded => None,
        }
    }
}

impl Serialize for Remaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u64(*n),
            Self::Unbounded => serializer.serialize_str("unlimited"),
        }
    }
}
