//! SQLite-backed ledger store and usage log.
//!
//! Tables:
//! - `accounts`: id, subscription tier and status
//! - `credit_ledgers`: one row per account (general tokens, reset period)
//! - `credit_balances`: free counters and paid credits per (account, feature)
//! - `usage_log`: append-only consumption attempts
//!
//! Every decrement is a single `UPDATE ... WHERE balance >= ?` statement and
//! the affected row decides the outcome. Creation and monthly resets run in
//! `BEGIN IMMEDIATE` transactions so they take the write lock up front.

use super::error::StoreError;
use super::feature::{Feature, PoolKind, PoolTarget};
use super::ledger::{Account, CreditLedger, FreeAllotments, Period};
use super::store::{DebitOutcome, LedgerStore, UsageLog};
use super::usage::{UsageMetadata, UsageRecord, UsageSummary};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default pool size; WAL lets readers run alongside the single writer.
pub const DEFAULT_POOL_SIZE: u32 = 8;

/// Default time a writer waits on SQLite's lock before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const FREE: &str = "free";
const PAID: &str = "paid";

pub struct SqliteLedgerStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // journal_mode needs an exclusive lock; set it once before pooling.
        {
            let conn = Connection::open(db_path)?;
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;",
            )?;
            Self::init_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        Ok(Self { pool })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id         TEXT PRIMARY KEY,
                tier       TEXT NOT NULL DEFAULT 'free',
                status     TEXT NOT NULL DEFAULT 'inactive',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credit_ledgers (
                account_id      TEXT PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
                general_tokens  INTEGER NOT NULL DEFAULT 0 CHECK (general_tokens >= 0),
                reset_period    INTEGER NOT NULL,
                last_free_reset TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credit_balances (
                account_id TEXT NOT NULL REFERENCES credit_ledgers(account_id) ON DELETE CASCADE,
                pool       TEXT NOT NULL CHECK (pool IN ('free', 'paid')),
                feature    TEXT NOT NULL,
                balance    INTEGER NOT NULL CHECK (balance >= 0),
                PRIMARY KEY (account_id, pool, feature)
            );

            CREATE TABLE IF NOT EXISTS usage_log (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                feature    TEXT NOT NULL,
                units      INTEGER NOT NULL,
                pool       TEXT,
                success    INTEGER NOT NULL,
                error      TEXT,
                metadata   TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_account_time ON usage_log(account_id, created_at);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn ledger_exists(conn: &Connection, account_id: &str) -> Result<bool, StoreError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM credit_ledgers WHERE account_id = ?1",
                params![account_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_free_counters(
        conn: &Connection,
        account_id: &str,
        allotments: &FreeAllotments,
    ) -> Result<(), StoreError> {
        let mut stmt = conn.prepare(
            "INSERT INTO credit_balances (account_id, pool, feature, balance)
             VALUES (?1, 'free', ?2, ?3)",
        )?;
        for (feature, allotment) in allotments {
            stmt.execute(params![account_id, feature.as_str(), to_sql_int(*allotment)?])?;
        }
        Ok(())
    }

    fn load_ledger(conn: &mut Connection, account_id: &str) -> Result<Option<CreditLedger>, StoreError> {
        // Read both tables from one snapshot.
        let tx = conn.transaction()?;

        let head = tx
            .query_row(
                "SELECT general_tokens, last_free_reset FROM credit_ledgers WHERE account_id = ?1",
                params![account_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((general_tokens, last_free_reset)) = head else {
            return Ok(None);
        };

        let mut free_counters = BTreeMap::new();
        let mut paid_balances = BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT pool, feature, balance FROM credit_balances WHERE account_id = ?1",
            )?;
            let rows = stmt.query_map(params![account_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (pool, feature, balance) = row?;
                let feature = parse_feature(&feature)?;
                let balance = from_sql_int(balance)?;
                match pool.as_str() {
                    FREE => {
                        free_counters.insert(feature, balance);
                    }
                    PAID => {
                        paid_balances.insert(feature, balance);
                    }
                    other => return Err(StoreError::Corrupt(format!("unknown pool '{other}'"))),
                }
            }
        }
        tx.commit()?;

        Ok(Some(CreditLedger {
            account_id: account_id.to_string(),
            free_counters,
            paid_balances,
            general_tokens: from_sql_int(general_tokens)?,
            last_free_reset: parse_ts(&last_free_reset)?,
        }))
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, tier, status FROM accounts WHERE id = ?1",
                params![account_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, tier, status)| -> Result<Account, StoreError> {
            Ok(Account {
                id,
                tier: tier.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))?,
                status: status
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            })
        })
        .transpose()
    }

    fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        let now = now_epoch();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (id, tier, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                tier = excluded.tier,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![account.id, account.tier.as_str(), account.status.as_str(), now],
        )?;
        Ok(())
    }

    fn delete_account(&self, account_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM accounts WHERE id = ?1", params![account_id])?;
        Ok(deleted > 0)
    }

    fn ledger(&self, account_id: &str) -> Result<Option<CreditLedger>, StoreError> {
        let mut conn = self.conn()?;
        Self::load_ledger(&mut conn, account_id)
    }

    fn create_ledger(
        &self,
        account_id: &str,
        allotments: &FreeAllotments,
        now: DateTime<Utc>,
    ) -> Result<CreditLedger, StoreError> {
        let mut conn = self.conn()?;
        {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let account_exists = tx
                .query_row(
                    "SELECT 1 FROM accounts WHERE id = ?1",
                    params![account_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !account_exists {
                return Err(StoreError::AccountNotFound(account_id.to_string()));
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO credit_ledgers
                    (account_id, general_tokens, reset_period, last_free_reset, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?3, ?4, ?4)",
                params![account_id, Period::of(now).index(), fmt_ts(now), now_epoch()],
            )?;
            if inserted == 1 {
                Self::insert_free_counters(&tx, account_id, allotments)?;
            }
            tx.commit()?;
        }

        Self::load_ledger(&mut conn, account_id)?
            .ok_or_else(|| StoreError::LedgerUninitialized(account_id.to_string()))
    }

    fn reset_free_tier(
        &self,
        account_id: &str,
        current: Period,
        allotments: &FreeAllotments,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed = tx.execute(
            "UPDATE credit_ledgers
             SET reset_period = ?1, last_free_reset = ?2, updated_at = ?3
             WHERE account_id = ?4 AND reset_period < ?1",
            params![current.index(), fmt_ts(now), now_epoch(), account_id],
        )?;

        if claimed == 0 {
            if !Self::ledger_exists(&tx, account_id)? {
                return Err(StoreError::LedgerUninitialized(account_id.to_string()));
            }
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM credit_balances WHERE account_id = ?1 AND pool = 'free'",
            params![account_id],
        )?;
        Self::insert_free_counters(&tx, account_id, allotments)?;
        tx.commit()?;
        Ok(true)
    }

    fn debit(
        &self,
        account_id: &str,
        target: PoolTarget,
        units: u64,
        period: Period,
    ) -> Result<DebitOutcome, StoreError> {
        let conn = self.conn()?;
        let units = to_sql_int(units)?;

        let remaining: Option<i64> = match target {
            PoolTarget::General => conn
                .query_row(
                    "UPDATE credit_ledgers
                     SET general_tokens = general_tokens - ?1, updated_at = ?2
                     WHERE account_id = ?3 AND general_tokens >= ?1
                     RETURNING general_tokens",
                    params![units, now_epoch(), account_id],
                    |row| row.get(0),
                )
                .optional()?,
            PoolTarget::Paid(feature) => conn
                .query_row(
                    "UPDATE credit_balances
                     SET balance = balance - ?1
                     WHERE account_id = ?2 AND pool = 'paid' AND feature = ?3 AND balance >= ?1
                     RETURNING balance",
                    params![units, account_id, feature.as_str()],
                    |row| row.get(0),
                )
                .optional()?,
            PoolTarget::Free(feature) => conn
                .query_row(
                    "UPDATE credit_balances
                     SET balance = balance - ?1
                     WHERE account_id = ?2 AND pool = 'free' AND feature = ?3 AND balance >= ?1
                       AND EXISTS (
                           SELECT 1 FROM credit_ledgers
                           WHERE account_id = ?2 AND reset_period = ?4
                       )
                     RETURNING balance",
                    params![units, account_id, feature.as_str(), period.index()],
                    |row| row.get(0),
                )
                .optional()?,
        };

        match remaining {
            Some(remaining) => Ok(DebitOutcome::Applied {
                remaining: from_sql_int(remaining)?,
            }),
            None if Self::ledger_exists(&conn, account_id)? => Ok(DebitOutcome::Rejected),
            None => Err(StoreError::LedgerUninitialized(account_id.to_string())),
        }
    }

    fn credit(&self, account_id: &str, target: PoolTarget, amount: u64) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let amount = to_sql_int(amount)?;

        let balance: Option<i64> = match target {
            PoolTarget::General => conn
                .query_row(
                    "UPDATE credit_ledgers
                     SET general_tokens = general_tokens + ?1, updated_at = ?2
                     WHERE account_id = ?3
                     RETURNING general_tokens",
                    params![amount, now_epoch(), account_id],
                    |row| row.get(0),
                )
                .optional()?,
            PoolTarget::Paid(feature) | PoolTarget::Free(feature) => {
                if !Self::ledger_exists(&conn, account_id)? {
                    return Err(StoreError::LedgerUninitialized(account_id.to_string()));
                }
                let pool = if matches!(target, PoolTarget::Free(_)) { FREE } else { PAID };
                Some(conn.query_row(
                    "INSERT INTO credit_balances (account_id, pool, feature, balance)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(account_id, pool, feature) DO UPDATE SET
                        balance = balance + excluded.balance
                     RETURNING balance",
                    params![account_id, pool, feature.as_str(), amount],
                    |row| row.get(0),
                )?)
            }
        };

        match balance {
            Some(balance) => from_sql_int(balance),
            None => Err(StoreError::LedgerUninitialized(account_id.to_string())),
        }
    }
}

impl UsageLog for SqliteLedgerStore {
    fn append(&self, record: &UsageRecord) -> Result<i64, StoreError> {
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO usage_log
                (account_id, feature, units, pool, success, error, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.account_id,
                record.feature.as_str(),
                to_sql_int(record.units)?,
                record.pool.map(PoolKind::as_str),
                record.success,
                record.error,
                metadata,
                fmt_ts(record.timestamp),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn recent(&self, account_id: &str, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, feature, units, pool, success, error, metadata, created_at
             FROM usage_log WHERE account_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![account_id, limit], RawUsageRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.decode()?);
        }
        Ok(records)
    }

    fn summary(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, feature, units, pool, success, error, metadata, created_at
             FROM usage_log
             WHERE account_id = ?1 AND (?2 IS NULL OR created_at >= ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(
            params![account_id, since.map(fmt_ts)],
            RawUsageRow::from_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.decode()?);
        }
        Ok(UsageSummary::from_records(account_id, since, &records))
    }
}

/// Usage row as stored, before enum and timestamp decoding.
struct RawUsageRow {
    id: i64,
    account_id: String,
    feature: String,
    units: i64,
    pool: Option<String>,
    success: bool,
    error: Option<String>,
    metadata: Option<String>,
    created_at: String,
}

impl RawUsageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            feature: row.get(2)?,
            units: row.get(3)?,
            pool: row.get(4)?,
            success: row.get(5)?,
            error: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<UsageRecord, StoreError> {
        let pool = self
            .pool
            .as_deref()
            .map(str::parse::<PoolKind>)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<UsageMetadata>)
            .transpose()?;

        Ok(UsageRecord {
            id: self.id,
            account_id: self.account_id,
            feature: parse_feature(&self.feature)?,
            units: from_sql_int(self.units)?,
            pool,
            success: self.success,
            error: self.error,
            metadata,
            timestamp: parse_ts(&self.created_at)?,
        })
    }
}

fn parse_feature(s: &str) -> Result<Feature, StoreError> {
    s.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("value {value} exceeds INTEGER range")))
}

fn from_sql_int(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative balance {value}")))
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

/// Get current epoch seconds.
fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::feature::{SubscriptionStatus, SubscriptionTier};
    use crate::billing::ledger::default_allotments;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, SqliteLedgerStore) {
        let tmp = TempDir::new().unwrap();
        let store =
            SqliteLedgerStore::open(&tmp.path().join("ledger.db"), 4, DEFAULT_BUSY_TIMEOUT).unwrap();
        (tmp, store)
    }

    fn jan() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 8, 30, 0).unwrap()
    }

    fn feb() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 8, 30, 0).unwrap()
    }

    fn with_ledger(store: &SqliteLedgerStore, id: &str) -> CreditLedger {
        store.upsert_account(&Account::new(id)).unwrap();
        store.create_ledger(id, &default_allotments(), jan()).unwrap()
    }

    #[test]
    fn account_upsert_and_lookup() {
        let (_tmp, store) = test_store();
        assert!(store.account("acct").unwrap().is_none());

        store.upsert_account(&Account::new("acct")).unwrap();
        store
            .upsert_account(
                &Account::new("acct")
                    .with_subscription(SubscriptionTier::Pro, SubscriptionStatus::Active),
            )
            .unwrap();

        let account = store.account("acct").unwrap().unwrap();
        assert_eq!(account.tier, SubscriptionTier::Pro);
        assert_eq!(account.status, SubscriptionStatus::Active);
    }

    #[test]
    fn create_ledger_seeds_free_counters() {
        let (_tmp, store) = test_store();
        let ledger = with_ledger(&store, "acct");
        assert_eq!(ledger.free_counters, default_allotments());
        assert_eq!(ledger.general_tokens, 0);
        assert_eq!(ledger.last_free_reset, jan());
    }

    #[test]
    fn create_ledger_for_unknown_account_fails() {
        let (_tmp, store) = test_store();
        let err = store
            .create_ledger("ghost", &default_allotments(), jan())
            .unwrap_err();
        assert!(matches!(err, StoreError::AccountNotFound(_)));
    }

    #[test]
    fn create_ledger_twice_keeps_existing_balances() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");
        store
            .debit(
                "acct",
                PoolTarget::Free(Feature::BackgroundRemoval),
                2,
                Period::of(jan()),
            )
            .unwrap();

        let again = store.create_ledger("acct", &default_allotments(), feb()).unwrap();
        assert_eq!(again.free_counters[&Feature::BackgroundRemoval], 3);
        assert_eq!(again.last_free_reset, jan());
    }

    #[test]
    fn debit_is_conditional_on_balance() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");
        store.credit("acct", PoolTarget::General, 2).unwrap();

        let period = Period::of(jan());
        assert_eq!(
            store.debit("acct", PoolTarget::General, 3, period).unwrap(),
            DebitOutcome::Rejected
        );
        assert_eq!(
            store.debit("acct", PoolTarget::General, 2, period).unwrap(),
            DebitOutcome::Applied { remaining: 0 }
        );
        assert_eq!(
            store.debit("acct", PoolTarget::General, 1, period).unwrap(),
            DebitOutcome::Rejected
        );
        assert_eq!(store.ledger("acct").unwrap().unwrap().general_tokens, 0);
    }

    #[test]
    fn paid_debit_without_balance_row_is_rejected() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");
        let outcome = store
            .debit("acct", PoolTarget::Paid(Feature::ImageEditing), 1, Period::of(jan()))
            .unwrap();
        assert_eq!(outcome, DebitOutcome::Rejected);
    }

    #[test]
    fn debit_without_ledger_reports_uninitialized() {
        let (_tmp, store) = test_store();
        store.upsert_account(&Account::new("acct")).unwrap();
        let err = store
            .debit("acct", PoolTarget::General, 1, Period::of(jan()))
            .unwrap_err();
        assert!(matches!(err, StoreError::LedgerUninitialized(_)));
    }

    #[test]
    fn free_debit_rejected_after_period_moves() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");
        assert!(store
            .reset_free_tier("acct", Period::of(feb()), &default_allotments(), feb())
            .unwrap());

        let stale = store
            .debit(
                "acct",
                PoolTarget::Free(Feature::ImageUpscale),
                1,
                Period::of(jan()),
            )
            .unwrap();
        assert_eq!(stale, DebitOutcome::Rejected);

        let current = store
            .debit(
                "acct",
                PoolTarget::Free(Feature::ImageUpscale),
                1,
                Period::of(feb()),
            )
            .unwrap();
        assert_eq!(current, DebitOutcome::Applied { remaining: 2 });
    }

    #[test]
    fn reset_applies_once_per_period() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");
        for _ in 0..5 {
            store
                .debit(
                    "acct",
                    PoolTarget::Free(Feature::BackgroundRemoval),
                    1,
                    Period::of(jan()),
                )
                .unwrap();
        }

        let current = Period::of(feb());
        assert!(!store
            .reset_free_tier("acct", Period::of(jan()), &default_allotments(), jan())
            .unwrap());
        assert!(store
            .reset_free_tier("acct", current, &default_allotments(), feb())
            .unwrap());
        assert!(!store
            .reset_free_tier("acct", current, &default_allotments(), feb())
            .unwrap());

        let ledger = store.ledger("acct").unwrap().unwrap();
        assert_eq!(ledger.free_counters[&Feature::BackgroundRemoval], 5);
        assert_eq!(ledger.period(), current);
    }

    #[test]
    fn credit_accumulates_paid_and_general() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");

        assert_eq!(
            store
                .credit("acct", PoolTarget::Paid(Feature::WatermarkRemoval), 10)
                .unwrap(),
            10
        );
        assert_eq!(
            store
                .credit("acct", PoolTarget::Paid(Feature::WatermarkRemoval), 5)
                .unwrap(),
            15
        );
        assert_eq!(store.credit("acct", PoolTarget::General, 40).unwrap(), 40);

        let ledger = store.ledger("acct").unwrap().unwrap();
        assert_eq!(ledger.paid_balances[&Feature::WatermarkRemoval], 15);
        assert_eq!(ledger.general_tokens, 40);
    }

    #[test]
    fn delete_account_cascades_to_ledger() {
        let (_tmp, store) = test_store();
        with_ledger(&store, "acct");
        store
            .credit("acct", PoolTarget::Paid(Feature::ImageUpscale), 3)
            .unwrap();

        assert!(store.delete_account("acct").unwrap());
        assert!(store.ledger("acct").unwrap().is_none());
        assert!(!store.delete_account("acct").unwrap());
    }

    #[test]
    fn usage_log_roundtrips_metadata() {
        let (_tmp, store) = test_store();
        let record = UsageRecord {
            id: 0,
            account_id: "acct".into(),
            feature: Feature::BackgroundRemoval,
            units: 1,
            pool: Some(PoolKind::Free),
            success: true,
            error: None,
            metadata: Some(UsageMetadata {
                input_url: Some("s3://in/cat.png".into()),
                processing_time_ms: Some(1200),
                ..Default::default()
            }),
            timestamp: jan(),
        };
        let id = store.append(&record).unwrap();
        assert!(id > 0);

        let stored = store.recent("acct", 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].metadata, record.metadata);
        assert_eq!(stored[0].timestamp, jan());
    }

    #[test]
    fn usage_summary_filters_by_since() {
        let (_tmp, store) = test_store();
        for (at, success) in [(jan(), true), (feb(), true), (feb(), false)] {
            store
                .append(&UsageRecord {
                    id: 0,
                    account_id: "acct".into(),
                    feature: Feature::ImageUpscale,
                    units: 1,
                    pool: success.then_some(PoolKind::General),
                    success,
                    error: (!success).then(|| "InsufficientCredits".into()),
                    metadata: None,
                    timestamp: at,
                })
                .unwrap();
        }

        let all = store.summary("acct", None).unwrap();
        assert_eq!(all.attempts, 3);

        let since_feb = store
            .summary("acct", Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()))
            .unwrap();
        assert_eq!(since_feb.attempts, 2);
        assert_eq!(since_feb.successes, 1);
        assert_eq!(since_feb.failures, 1);
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let (_tmp, store) = test_store();
        for units in 1..=4 {
            store
                .append(&UsageRecord {
                    id: 0,
                    account_id: "acct".into(),
                    feature: Feature::ImageEditing,
                    units,
                    pool: Some(PoolKind::Subscription),
                    success: true,
                    error: None,
                    metadata: None,
                    timestamp: jan(),
                })
                .unwrap();
        }
        let recent = store.recent("acct", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].units, 4);
        assert_eq!(recent[1].units, 3);
    }
}
