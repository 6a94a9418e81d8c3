use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reward_ledger_core::{
    format_rfc3339, parse_rfc3339_utc, PendingDeltas, RewardDelta, RewardKey, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use ulid::Ulid;

use crate::{
    collect_rows, format_optional, from_sql_count, open_connection, parse_optional_timestamp,
    parse_stored_key, parse_stored_kind, parse_stored_meta, register_migration, to_sql_count,
};

const OUTBOX_COMPONENT: &str = "pending_deltas";
const OUTBOX_MIGRATION_VERSION: i64 = 1;

const SCHEMA_OUTBOX_V1: &str = r"
CREATE TABLE IF NOT EXISTS pending_deltas (
  user_id TEXT NOT NULL CHECK (length(user_id) >= 1),
  reward_key TEXT NOT NULL CHECK (length(reward_key) >= 1),
  slot TEXT NOT NULL CHECK (slot IN ('unacked', 'queued')),
  patch_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('enter', 'success', 'achievement')),
  claimed_at TEXT,
  xp_delta INTEGER NOT NULL CHECK (xp_delta >= 0),
  hit_delta INTEGER NOT NULL CHECK (hit_delta >= 0),
  meta_json TEXT NOT NULL DEFAULT '{}',
  observed_at TEXT NOT NULL,
  PRIMARY KEY (user_id, reward_key, slot)
);
";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Slot {
    Unacked,
    Queued,
}

impl Slot {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unacked => "unacked",
            Self::Queued => "queued",
        }
    }
}

/// On-device queue of deltas the remote store has not acknowledged yet.
///
/// Each (user, key) has at most two rows. The `unacked` row was sent and may
/// already be applied remotely, so it is replayed verbatim. The `queued` row
/// absorbs every later write for the key.
pub struct SqliteDeltaOutbox {
    conn: Connection,
}

impl SqliteDeltaOutbox {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_OUTBOX_V1)
            .context("failed to apply pending_deltas schema")?;
        register_migration(&self.conn, OUTBOX_COMPONENT, OUTBOX_MIGRATION_VERSION)
    }

    /// Queues a delta observed after anything already pending for `key`.
    pub fn push(&mut self, user_id: &UserId, key: &RewardKey, delta: RewardDelta) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start outbox transaction")?;

        let combined = match fetch_slot(&tx, user_id, key, Slot::Queued)? {
            Some(existing) => existing.coalesce(delta),
            None => delta,
        };
        write_slot(&tx, user_id, key, Slot::Queued, &combined)?;

        tx.commit().context("failed to commit outbox transaction")?;
        Ok(())
    }

    /// Puts back a delta that was taken for delivery but not acknowledged.
    /// It keeps its `patch_id` so a replay of an ambiguous write stays
    /// idempotent on the store side.
    pub fn restore(
        &mut self,
        user_id: &UserId,
        key: &RewardKey,
        delta: RewardDelta,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start outbox transaction")?;

        if fetch_slot(&tx, user_id, key, Slot::Unacked)?.is_none() {
            write_slot(&tx, user_id, key, Slot::Unacked, &delta)?;
        } else {
            // Only one delivery per key runs at a time, so this is a delta
            // that never left the device.
            let combined = match fetch_slot(&tx, user_id, key, Slot::Queued)? {
                Some(newer) => delta.coalesce(newer),
                None => delta,
            };
            write_slot(&tx, user_id, key, Slot::Queued, &combined)?;
        }

        tx.commit().context("failed to commit outbox transaction")?;
        Ok(())
    }

    /// Removes and returns the next delta to deliver for `key`: the
    /// unacknowledged one first, then the queued one.
    pub fn take(&mut self, user_id: &UserId, key: &RewardKey) -> Result<Option<RewardDelta>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start outbox transaction")?;

        let mut taken = None;
        for slot in [Slot::Unacked, Slot::Queued] {
            if let Some(delta) = fetch_slot(&tx, user_id, key, slot)? {
                tx.execute(
                    "DELETE FROM pending_deltas
                     WHERE user_id = ?1 AND reward_key = ?2 AND slot = ?3",
                    params![user_id.as_str(), key.as_str(), slot.as_str()],
                )
                .with_context(|| format!("failed to remove pending delta for {key}"))?;
                taken = Some(delta);
                break;
            }
        }

        tx.commit().context("failed to commit outbox transaction")?;
        Ok(taken)
    }

    pub fn peek(&self, user_id: &UserId, key: &RewardKey) -> Result<PendingDeltas> {
        Ok(PendingDeltas {
            unacked: fetch_slot(&self.conn, user_id, key, Slot::Unacked)?,
            queued: fetch_slot(&self.conn, user_id, key, Slot::Queued)?,
        })
    }

    /// Pending work for `user_id`, one entry per key, ordered by key.
    pub fn pending(&self, user_id: &UserId) -> Result<Vec<(RewardKey, PendingDeltas)>> {
        let mut stmt = self.conn.prepare(
            "SELECT reward_key, slot, patch_id, kind, claimed_at, xp_delta, hit_delta,
                    meta_json, observed_at
             FROM pending_deltas
             WHERE user_id = ?1
             ORDER BY reward_key ASC, slot DESC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], |row| {
            let key_raw: String = row.get(0)?;
            let slot_raw: String = row.get(1)?;
            Ok((parse_stored_key(&key_raw)?, slot_raw, parse_delta_row(row, 2)?))
        })?;

        let mut grouped: Vec<(RewardKey, PendingDeltas)> = Vec::new();
        for (key, slot_raw, delta) in collect_rows(rows)? {
            if grouped.last().map(|(last, _)| last) != Some(&key) {
                grouped.push((key, PendingDeltas::default()));
            }
            if let Some((_, entry)) = grouped.last_mut() {
                if slot_raw == Slot::Unacked.as_str() {
                    entry.unacked = Some(delta);
                } else {
                    entry.queued = Some(delta);
                }
            }
        }
        Ok(grouped)
    }
}

fn write_slot(
    conn: &Connection,
    user_id: &UserId,
    key: &RewardKey,
    slot: Slot,
    delta: &RewardDelta,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_deltas(
            user_id, reward_key, slot, patch_id, kind, claimed_at,
            xp_delta, hit_delta, meta_json, observed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(user_id, reward_key, slot) DO UPDATE SET
            patch_id = excluded.patch_id,
            kind = excluded.kind,
            claimed_at = excluded.claimed_at,
            xp_delta = excluded.xp_delta,
            hit_delta = excluded.hit_delta,
            meta_json = excluded.meta_json,
            observed_at = excluded.observed_at",
        params![
            user_id.as_str(),
            key.as_str(),
            slot.as_str(),
            delta.patch_id.to_string(),
            delta.kind.as_str(),
            format_optional(delta.claimed_at)?,
            to_sql_count(delta.xp_delta, "xp_delta")?,
            to_sql_count(delta.hit_delta, "hit_delta")?,
            serde_json::to_string(&delta.meta).context("failed to serialize meta")?,
            format_rfc3339(delta.observed_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .with_context(|| format!("failed to queue pending delta for {key}"))?;
    Ok(())
}

fn fetch_slot(
    conn: &Connection,
    user_id: &UserId,
    key: &RewardKey,
    slot: Slot,
) -> Result<Option<RewardDelta>> {
    let mut stmt = conn.prepare(
        "SELECT patch_id, kind, claimed_at, xp_delta, hit_delta, meta_json, observed_at
         FROM pending_deltas
         WHERE user_id = ?1 AND reward_key = ?2 AND slot = ?3",
    )?;

    let row = stmt
        .query_row(
            params![user_id.as_str(), key.as_str(), slot.as_str()],
            |row| parse_delta_row(row, 0),
        )
        .optional()
        .with_context(|| format!("failed to read pending delta for {key}"))?;

    Ok(row)
}

fn parse_delta_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<RewardDelta> {
    let patch_id_raw: String = row.get(offset)?;
    let kind_raw: String = row.get(offset + 1)?;
    let claimed_at_raw: Option<String> = row.get(offset + 2)?;
    let xp_delta: i64 = row.get(offset + 3)?;
    let hit_delta: i64 = row.get(offset + 4)?;
    let meta_raw: String = row.get(offset + 5)?;
    let observed_at_raw: String = row.get(offset + 6)?;

    let patch_id = Ulid::from_string(&patch_id_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            offset,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })?;
    let observed_at = parse_rfc3339_utc(&observed_at_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            offset + 6,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })?;

    Ok(RewardDelta {
        patch_id,
        kind: parse_stored_kind(&kind_raw)?,
        claimed_at: parse_optional_timestamp(claimed_at_raw.as_deref())?,
        xp_delta: from_sql_count(xp_delta, "xp_delta")?,
        hit_delta: from_sql_count(hit_delta, "hit_delta")?,
        meta: parse_stored_meta(&meta_raw)?,
        observed_at,
    })
}
