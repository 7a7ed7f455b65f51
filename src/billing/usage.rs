//! Append-only usage log records and reporting types.

use super::feature::{Feature, PoolKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied context about the gated operation.
///
/// Attached to the usage record for observability only; it never influences
/// the consumption decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    /// Whether the downstream operation itself succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_succeeded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One consumption attempt, successful or not. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    /// Assigned by the log on append; 0 before that.
    pub id: i64,
    pub account_id: String,
    pub feature: Feature,
    pub units: u64,
    /// `None` when no pool was selected (e.g. nothing available).
    pub pool: Option<PoolKind>,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Option<UsageMetadata>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate usage for one (feature, pool) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageBreakdown {
    pub feature: Feature,
    pub pool: Option<PoolKind>,
    pub attempts: u64,
    pub successes: u64,
    pub units_consumed: u64,
}

/// Usage report for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub account_id: String,
    pub since: Option<DateTime<Utc>>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub by_feature: Vec<UsageBreakdown>,
}

impl UsageSummary {
    /// Fold records into a summary. Records must already be filtered by account.
    pub fn from_records(
        account_id: &str,
        since: Option<DateTime<Utc>>,
        records: &[UsageRecord],
    ) -> Self {
        let mut by_feature: Vec<UsageBreakdown> = Vec::new();
        let mut successes = 0u64;

        for record in records {
            if record.success {
                successes += 1;
            }
            let idx = match by_feature
                .iter()
                .position(|b| b.feature == record.feature && b.pool == record.pool)
            {
                Some(idx) => idx,
                None => {
                    by_feature.push(UsageBreakdown {
                        feature: record.feature,
                        pool: record.pool,
                        attempts: 0,
                        successes: 0,
                        units_consumed: 0,
                    });
                    by_feature.len() - 1
                }
            };
            let row = &mut by_feature[idx];
            row.attempts += 1;
            if record.success {
                row.successes += 1;
                row.units_consumed += record.units;
            }
        }

        by_feature.sort_by(|a, b| {
            a.feature
                .cmp(&b.feature)
                .then_with(|| pool_rank(a.pool).cmp(&pool_rank(b.pool)))
        });

        let attempts = records.len() as u64;
        Self {
            account_id: account_id.to_string(),
            since,
            attempts,
            successes,
            failures: attempts - successes,
            by_feature,
        }
    }
}

fn pool_rank(pool: Option<PoolKind>) -> u8 {
    match pool {
        Some(PoolKind::Subscription) => 0,
        Some(PoolKind::Free) => 1,
        Some(PoolKind::Paid) => 2,
        Some(PoolKind::General) => 3,
        None => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(feature: Feature, pool: Option<PoolKind>, units: u64, success: bool) -> UsageRecord {
        UsageRecord {
            id: 0,
            account_id: "acct".into(),
            feature,
            units,
            pool,
            success,
            error: (!success).then(|| "InsufficientCredits".to_string()),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn summary_groups_by_feature_and_pool() {
        let records = vec![
            record(Feature::ImageUpscale, Some(PoolKind::General), 2, true),
            record(Feature::BackgroundRemoval, Some(PoolKind::Free), 1, true),
            record(Feature::BackgroundRemoval, Some(PoolKind::Free), 1, true),
            record(Feature::BackgroundRemoval, None, 1, false),
        ];

        let summary = UsageSummary::from_records("acct", None, &records);
        assert_eq!(summary.attempts, 4);
        assert_eq!(summary.successes, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.by_feature.len(), 3);

        let free = &summary.by_feature[0];
        assert_eq!(free.feature, Feature::BackgroundRemoval);
        assert_eq!(free.pool, Some(PoolKind::Free));
        assert_eq!(free.units_consumed, 2);

        let denied = &summary.by_feature[1];
        assert_eq!(denied.pool, None);
        assert_eq!(denied.successes, 0);
        assert_eq!(denied.units_consumed, 0);

        assert_eq!(summary.by_feature[2].units_consumed, 2);
    }

    #[test]
    fn metadata_omits_empty_fields() {
        let meta = UsageMetadata {
            processing_time_ms: Some(850),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json, serde_json::json!({"processing_time_ms": 850}));
    }
}
