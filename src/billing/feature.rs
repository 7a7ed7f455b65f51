//! Closed enumerations shared by every billing component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A gated feature that consumes credits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    BackgroundRemoval,
    ImageUpscale,
    WatermarkRemoval,
    ImageEditing,
}

impl Feature {
    /// Every feature, in declaration order.
    pub const ALL: [Feature; 4] = [
        Feature::BackgroundRemoval,
        Feature::ImageUpscale,
        Feature::WatermarkRemoval,
        Feature::ImageEditing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BackgroundRemoval => "background_removal",
            Self::ImageUpscale => "image_upscale",
            Self::WatermarkRemoval => "watermark_removal",
            Self::ImageEditing => "image_editing",
        }
    }

    /// Human-readable name used in user-facing messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::BackgroundRemoval => "background removal",
            Self::ImageUpscale => "image upscaling",
            Self::WatermarkRemoval => "watermark removal",
            Self::ImageEditing => "image editing",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown feature, pool, tier or status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl FromStr for Feature {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s.trim())
            .ok_or_else(|| ParseEnumError::new("feature", s))
    }
}

/// Which source paid (or would pay) for a unit of usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Free,
    Paid,
    General,
    Subscription,
}

impl PoolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
            Self::General => "general",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "free" => Ok(Self::Free),
            "paid" => Ok(Self::Paid),
            "general" => Ok(Self::General),
            "subscription" => Ok(Self::Subscription),
            other => Err(ParseEnumError::new("pool", other)),
        }
    }
}

/// A concrete balance that can be debited or credited.
///
/// Subscription access has no balance and therefore no target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "pool", content = "feature", rename_all = "lowercase")]
pub enum PoolTarget {
    /// The feature's monthly free counter.
    Free(Feature),
    /// The feature's purchased credits.
    Paid(Feature),
    /// The fungible token pool.
    General,
}

impl PoolTarget {
    pub fn kind(self) -> PoolKind {
        match self {
            Self::Free(_) => PoolKind::Free,
            Self::Paid(_) => PoolKind::Paid,
            Self::General => PoolKind::General,
        }
    }
}

/// Subscription plan, owned by the identity system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(ParseEnumError::new("subscription tier", other)),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    #[default]
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(ParseEnumError::new("subscription status", other)),
        }
    }
}

/// Free-tier enforcement mode.
///
/// `Unlimited` is the growth-phase override: every free-tier check succeeds
/// without reading or decrementing counters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum FreeTierPolicy {
    #[default]
    Enforced,
    Unlimited,
}

impl FromStr for FreeTierPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "enforced" => Ok(Self::Enforced),
            "unlimited" => Ok(Self::Unlimited),
            other => Err(ParseEnumError::new("free tier policy", other)),
        }
    }
}
