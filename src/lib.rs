#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

//! Credit and entitlement metering: free tiers, paid credits, general tokens
//! and subscription overrides, with an audit trail of every attempt.

pub mod billing;
pub mod config;
pub mod gateway;

pub use billing::{
    AvailabilityResult, BillingError, ConsumeFailure, ConsumptionResult, CreditEngine, Feature,
    PoolKind, PoolTarget,
};
pub use config::Config;
