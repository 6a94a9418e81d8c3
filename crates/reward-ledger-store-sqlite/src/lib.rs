#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reward_ledger_core::{
    format_rfc3339, merge_record, now_utc, parse_rfc3339_utc, summarize_progress, LedgerError,
    ReconciliationConflict, RewardDelta, RewardKey, RewardKind, RewardRecord, UserId,
    UserProgress,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use time::OffsetDateTime;

mod outbox;

pub use outbox::SqliteDeltaOutbox;

const RECORDS_COMPONENT: &str = "reward_records";
const RECORDS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_MIGRATIONS: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  component TEXT NOT NULL,
  version INTEGER NOT NULL,
  applied_at TEXT NOT NULL,
  PRIMARY KEY (component, version)
);
";

const SCHEMA_RECORDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS reward_records (
  user_id TEXT NOT NULL CHECK (length(user_id) >= 1),
  reward_key TEXT NOT NULL CHECK (length(reward_key) >= 1),
  kind TEXT NOT NULL CHECK (kind IN ('enter', 'success', 'achievement')),
  granted_at TEXT,
  xp_total INTEGER NOT NULL CHECK (xp_total >= 0),
  hit_count INTEGER NOT NULL CHECK (hit_count >= 0),
  meta_json TEXT NOT NULL DEFAULT '{}',
  last_hit_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, reward_key)
);

CREATE TRIGGER IF NOT EXISTS trg_reward_records_merge_only
BEFORE UPDATE ON reward_records
WHEN (OLD.granted_at IS NOT NULL AND (NEW.granted_at IS NULL OR NEW.granted_at <> OLD.granted_at))
  OR NEW.xp_total < OLD.xp_total
  OR NEW.hit_count < OLD.hit_count
  OR NEW.kind <> OLD.kind
BEGIN
  SELECT RAISE(FAIL, 'reward_records is merge-only');
END;

CREATE INDEX IF NOT EXISTS idx_reward_records_user_kind
  ON reward_records(user_id, kind);

CREATE TABLE IF NOT EXISTS applied_patches (
  user_id TEXT NOT NULL,
  reward_key TEXT NOT NULL,
  patch_id TEXT NOT NULL,
  applied_at TEXT NOT NULL,
  PRIMARY KEY (user_id, reward_key, patch_id)
);
";

/// Durable reward documents, one logical collection per user.
pub struct SqliteRewardStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MergeReceipt {
    pub record: RewardRecord,
    pub conflict: Option<ReconciliationConflict>,
    /// The patch had already been applied; nothing changed.
    pub replayed: bool,
}

impl SqliteRewardStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_RECORDS_V1)
            .context("failed to apply reward records schema")?;

        register_migration(&self.conn, RECORDS_COMPONENT, RECORDS_MIGRATION_VERSION)
    }

    pub fn fetch(&self, user_id: &UserId, key: &RewardKey) -> Result<Option<RewardRecord>> {
        fetch_record(&self.conn, user_id, key)
    }

    /// Applies `delta` atomically: counters are incremented in SQL,
    /// `granted_at` is only set when absent, and a `patch_id` seen before is
    /// not applied again.
    pub fn merge(
        &mut self,
        user_id: &UserId,
        key: &RewardKey,
        delta: &RewardDelta,
    ) -> Result<MergeReceipt> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start merge transaction")?;

        let patch_id = delta.patch_id.to_string();
        let already_applied = tx
            .query_row(
                "SELECT 1 FROM applied_patches
                 WHERE user_id = ?1 AND reward_key = ?2 AND patch_id = ?3",
                params![user_id.as_str(), key.as_str(), patch_id],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query applied_patches")?
            .is_some();

        let existing = fetch_record(&tx, user_id, key)?;

        if already_applied {
            let record = existing.ok_or_else(|| {
                anyhow!("patch {patch_id} is recorded as applied but {key} has no record")
            })?;
            tx.commit().context("failed to commit merge transaction")?;
            return Ok(MergeReceipt {
                record,
                conflict: None,
                replayed: true,
            });
        }

        let conflict = merge_record(existing.as_ref(), key, delta).conflict;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        tx.execute(
            "INSERT INTO reward_records(
                user_id, reward_key, kind, granted_at, xp_total, hit_count,
                meta_json, last_hit_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, reward_key) DO UPDATE SET
                granted_at = COALESCE(reward_records.granted_at, excluded.granted_at),
                xp_total = reward_records.xp_total + excluded.xp_total,
                hit_count = reward_records.hit_count + excluded.hit_count,
                meta_json = excluded.meta_json,
                last_hit_at = excluded.last_hit_at,
                updated_at = excluded.updated_at",
            params![
                user_id.as_str(),
                key.as_str(),
                delta.kind.as_str(),
                format_optional(delta.claimed_at)?,
                to_sql_count(delta.xp_delta, "xp_delta")?,
                to_sql_count(delta.hit_delta, "hit_delta")?,
                serde_json::to_string(&delta.meta).context("failed to serialize meta")?,
                format_rfc3339(delta.observed_at).map_err(|err| anyhow!(err.to_string()))?,
                now,
            ],
        )
        .with_context(|| format!("failed to merge reward record {key}"))?;

        tx.execute(
            "INSERT INTO applied_patches(user_id, reward_key, patch_id, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id.as_str(), key.as_str(), patch_id, now],
        )
        .context("failed to register applied patch")?;

        let record = fetch_record(&tx, user_id, key)?
            .ok_or_else(|| anyhow!("reward record {key} missing after merge"))?;
        tx.commit().context("failed to commit merge transaction")?;

        Ok(MergeReceipt {
            record,
            conflict,
            replayed: false,
        })
    }

    pub fn list_records(&self, user_id: &UserId) -> Result<Vec<RewardRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT reward_key, kind, granted_at, xp_total, hit_count, meta_json, last_hit_at
             FROM reward_records
             WHERE user_id = ?1
             ORDER BY reward_key ASC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], parse_record_row)?;
        collect_rows(rows)
    }

    pub fn progress(&self, user_id: &UserId) -> Result<UserProgress> {
        let records = self.list_records(user_id)?;
        Ok(summarize_progress(user_id, &records))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

pub(crate) fn register_migration(conn: &Connection, component: &str, version: i64) -> Result<()> {
    conn.execute_batch(SCHEMA_MIGRATIONS)
        .context("failed to ensure schema_migrations exists")?;

    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(component, version, applied_at)
         VALUES (?1, ?2, ?3)",
        params![component, version, now],
    )
    .with_context(|| format!("failed to register {component} schema migration"))?;

    Ok(())
}

fn fetch_record(
    conn: &Connection,
    user_id: &UserId,
    key: &RewardKey,
) -> Result<Option<RewardRecord>> {
    let mut stmt = conn.prepare(
        "SELECT reward_key, kind, granted_at, xp_total, hit_count, meta_json, last_hit_at
         FROM reward_records
         WHERE user_id = ?1 AND reward_key = ?2",
    )?;

    let row = stmt
        .query_row(params![user_id.as_str(), key.as_str()], parse_record_row)
        .optional()
        .with_context(|| format!("failed to fetch reward record {key}"))?;

    Ok(row)
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RewardRecord> {
    let key_raw: String = row.get(0)?;
    let kind_raw: String = row.get(1)?;
    let granted_at_raw: Option<String> = row.get(2)?;
    let xp_total: i64 = row.get(3)?;
    let hit_count: i64 = row.get(4)?;
    let meta_raw: String = row.get(5)?;
    let last_hit_at_raw: String = row.get(6)?;

    Ok(RewardRecord {
        key: parse_stored_key(&key_raw)?,
        kind: parse_stored_kind(&kind_raw)?,
        granted_at: parse_optional_timestamp(granted_at_raw.as_deref())?,
        xp_total: from_sql_count(xp_total, "xp_total")?,
        hit_count: from_sql_count(hit_count, "hit_count")?,
        meta: parse_stored_meta(&meta_raw)?,
        last_hit_at: parse_rfc3339_utc(&last_hit_at_raw).map_err(to_sql_error)?,
    })
}

pub(crate) fn parse_stored_key(raw: &str) -> rusqlite::Result<RewardKey> {
    RewardKey::parse(raw, usize::MAX).map_err(to_sql_error)
}

pub(crate) fn parse_stored_kind(raw: &str) -> rusqlite::Result<RewardKind> {
    RewardKind::parse(raw).ok_or_else(|| {
        to_sql_error(LedgerError::Validation(format!(
            "unknown reward kind in store: {raw}"
        )))
    })
}

pub(crate) fn parse_stored_meta(raw: &str) -> rusqlite::Result<Map<String, Value>> {
    serde_json::from_str(raw).map_err(|err| {
        to_sql_error(LedgerError::Validation(format!(
            "invalid stored meta_json: {err}"
        )))
    })
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<&str>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.map(parse_rfc3339_utc)
        .transpose()
        .map_err(to_sql_error)
}

pub(crate) fn format_optional(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value
        .map(format_rfc3339)
        .transpose()
        .map_err(|err| anyhow!(err.to_string()))
}

pub(crate) fn to_sql_count(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{field} exceeds storage range: {value}"))
}

pub(crate) fn from_sql_count(value: i64, field: &str) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        to_sql_error(LedgerError::Validation(format!(
            "negative {field} in store: {value}"
        )))
    })
}

fn to_sql_error(err: LedgerError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use reward_ledger_core::DEFAULT_MAX_KEY_LEN;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteRewardStore {
        let store = must(SqliteRewardStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_user() -> UserId {
        match UserId::parse("user-1") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture user: {err}"),
        }
    }

    fn fixture_key(raw: &str) -> RewardKey {
        match RewardKey::parse(raw, DEFAULT_MAX_KEY_LEN) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture key: {err}"),
        }
    }

    fn fixture_time() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-03-01T09:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn delta(claimed: bool, xp: u64) -> RewardDelta {
        let at = fixture_time();
        RewardDelta::hit(
            RewardKind::Enter,
            claimed.then_some(at),
            xp,
            Map::default(),
            at,
        )
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("reward-ledger-{label}-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn merge_creates_record_on_first_write() {
        let mut store = fixture_store();
        let key = fixture_key("N5_Escritura:enter");

        let receipt = must(store.merge(&fixture_user(), &key, &delta(true, 10)));

        assert!(!receipt.replayed);
        assert!(receipt.conflict.is_none());
        assert_eq!(receipt.record.xp_total, 10);
        assert_eq!(receipt.record.hit_count, 1);
        assert_eq!(receipt.record.granted_at, Some(fixture_time()));
        assert_eq!(
            must(store.fetch(&fixture_user(), &key)),
            Some(receipt.record)
        );
    }

    #[test]
    fn merge_increments_and_keeps_first_grant() {
        let mut store = fixture_store();
        let key = fixture_key("senseidevista");

        must(store.merge(&fixture_user(), &key, &delta(true, 20)));
        let second = must(store.merge(&fixture_user(), &key, &delta(true, 20)));

        assert_eq!(second.record.xp_total, 40);
        assert_eq!(second.record.hit_count, 2);
        assert_eq!(second.record.granted_at, Some(fixture_time()));
        assert!(second.conflict.is_some());
    }

    #[test]
    fn replayed_patch_is_applied_once() {
        let mut store = fixture_store();
        let key = fixture_key("quiz:success");
        let patch = delta(true, 30);

        let first = must(store.merge(&fixture_user(), &key, &patch));
        let retry = must(store.merge(&fixture_user(), &key, &patch));

        assert!(!first.replayed);
        assert!(retry.replayed);
        assert_eq!(retry.record, first.record);
    }

    #[test]
    fn users_do_not_share_records() {
        let mut store = fixture_store();
        let key = fixture_key("N5_Escritura:enter");
        let other = must(UserId::parse("user-2").map_err(|err| anyhow!(err)));

        must(store.merge(&fixture_user(), &key, &delta(true, 10)));

        assert!(must(store.fetch(&other, &key)).is_none());
        assert_eq!(must(store.list_records(&other)).len(), 0);
        assert_eq!(must(store.list_records(&fixture_user())).len(), 1);
    }

    #[test]
    fn merge_only_trigger_blocks_regressions() {
        let mut store = fixture_store();
        let key = fixture_key("N5_Escritura:enter");
        must(store.merge(&fixture_user(), &key, &delta(true, 10)));

        let cleared = store.connection().execute(
            "UPDATE reward_records SET granted_at = NULL WHERE reward_key = ?1",
            params![key.as_str()],
        );
        assert!(cleared.is_err());

        let decreased = store.connection().execute(
            "UPDATE reward_records SET xp_total = 0 WHERE reward_key = ?1",
            params![key.as_str()],
        );
        assert!(decreased.is_err());
    }

    #[test]
    fn progress_sums_xp_and_lists_unlocked_achievements() {
        let mut store = fixture_store();
        let at = fixture_time();
        must(store.merge(
            &fixture_user(),
            &fixture_key("senseidevista"),
            &RewardDelta::hit(RewardKind::Achievement, Some(at), 20, Map::default(), at),
        ));
        must(store.merge(
            &fixture_user(),
            &fixture_key("N5_Escritura:enter"),
            &delta(true, 10),
        ));

        let progress = must(store.progress(&fixture_user()));
        assert_eq!(progress.total_xp, 30);
        assert_eq!(progress.record_count, 2);
        assert!(progress
            .unlocked_achievements
            .contains(&fixture_key("senseidevista")));
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        let key = fixture_key("N5_Escritura:enter");
        must(store.merge(&fixture_user(), &key, &delta(true, 10)));

        must(store.migrate());
        must(store.migrate());

        let record = must(store.fetch(&fixture_user(), &key));
        assert_eq!(record.map(|item| item.xp_total), Some(10));
    }

    #[test]
    fn concurrent_writers_do_not_lose_increments() {
        let path = temp_db_path("concurrent");
        must(must(SqliteRewardStore::open(&path)).migrate());

        let handles = (0..2)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut store = must(SqliteRewardStore::open(&path));
                    for index in 0..25 {
                        must(store.merge(
                            &fixture_user(),
                            &fixture_key("N5_Escritura:enter"),
                            &delta(index == 0, 5),
                        ));
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            if handle.join().is_err() {
                panic!("writer thread panicked");
            }
        }

        let store = must(SqliteRewardStore::open(&path));
        let record = must(store.fetch(&fixture_user(), &fixture_key("N5_Escritura:enter")));
        let record = match record {
            Some(value) => value,
            None => panic!("expected merged record"),
        };
        assert_eq!(record.hit_count, 50);
        assert_eq!(record.xp_total, 250);
        assert!(record.granted_at.is_some());

        let _ = std::fs::remove_file(&path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_store_merge_matches_core_fold(stream in prop::collection::vec((any::<bool>(), 0u64..50), 1..40)) {
            let mut store = fixture_store();
            let key = fixture_key("N5_Escritura:enter");
            let mut expected: Option<RewardRecord> = None;

            for (claimed, xp) in stream {
                let patch = delta(claimed, xp);
                expected = Some(merge_record(expected.as_ref(), &key, &patch).record);
                must(store.merge(&fixture_user(), &key, &patch));
            }

            let stored = must(store.fetch(&fixture_user(), &key));
            prop_assert_eq!(stored, expected);
        }
    }
}
