//! Credit and entitlement metering.
//!
//! Decides, per account and feature, whether a unit of usage is allowed,
//! which credit pool pays for it, and decrements that pool safely under
//! concurrent requests.
//!
//! ## Design
//! - Pools in fixed priority: subscription, free tier, paid credits, general tokens
//! - Every ledger mutation is a single conditional store operation
//! - Free-tier counters reset lazily on first access in a new month
//! - Every consumption attempt is appended to the usage log

pub mod clock;
pub mod consumer;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod feature;
pub mod ledger;
pub mod memory;
pub mod reset;
pub mod sqlite;
pub mod store;
pub mod usage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use consumer::{ConsumeFailure, ConsumptionResult, CreditConsumer};
pub use engine::{open_store, CreditEngine, CreditSummary, EngineSettings};
pub use entitlement::{AvailabilityResult, EntitlementChecker, NO_CREDITS_MESSAGE};
pub use error::{BillingError, StoreError};
pub use feature::{
    Feature, FreeTierPolicy, PoolKind, PoolTarget, SubscriptionStatus, SubscriptionTier,
};
pub use ledger::{default_allotments, Account, CreditLedger, FreeAllotments, Period, Remaining};
pub use memory::InMemoryLedgerStore;
pub use reset::{ensure_current_period, MonthlyReset};
pub use sqlite::SqliteLedgerStore;
pub use store::{DebitOutcome, LedgerStore, UsageLog};
pub use usage::{UsageBreakdown, UsageMetadata, UsageRecord, UsageSummary};
