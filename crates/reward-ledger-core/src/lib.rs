use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DEFAULT_MAX_KEY_LEN: usize = 256;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Identity of the user whose rewards a ledger instance manages.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the id is empty or blank.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        if raw.trim().is_empty() {
            return Err(LedgerError::Validation(
                "user_id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of one rewardable event. Only uniqueness matters.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RewardKey(String);

impl RewardKey {
    /// Validates a caller-supplied key against the configured length bound.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for empty, blank, or over-long keys.
    pub fn parse(raw: &str, max_len: usize) -> Result<Self, LedgerError> {
        if raw.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reward key MUST be a non-empty string".to_string(),
            ));
        }

        if raw.len() > max_len {
            return Err(LedgerError::Validation(format!(
                "reward key MUST be at most {max_len} bytes (got {})",
                raw.len()
            )));
        }

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RewardKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Enter,
    Success,
    Achievement,
}

impl RewardKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Success => "success",
            Self::Achievement => "achievement",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enter" => Some(Self::Enter),
            "success" => Some(Self::Success),
            "achievement" => Some(Self::Achievement),
            _ => None,
        }
    }
}

/// XP schedule for one award call: what the first hit pays and what each
/// later hit pays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct XpSchedule {
    pub first_xp: u32,
    pub repeat_xp: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AwardOutcome {
    pub first_time: bool,
    pub xp_granted: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardRecord {
    pub key: RewardKey,
    pub kind: RewardKind,
    #[serde(with = "time::serde::rfc3339::option")]
    pub granted_at: Option<OffsetDateTime>,
    pub xp_total: u64,
    pub hit_count: u64,
    pub meta: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_hit_at: OffsetDateTime,
}

impl RewardRecord {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.granted_at.is_some()
    }
}

/// One outstanding increment for a single key, as sent to the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardDelta {
    pub patch_id: Ulid,
    pub kind: RewardKind,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    pub xp_delta: u64,
    pub hit_delta: u64,
    pub meta: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl RewardDelta {
    /// Delta for a single observed hit.
    #[must_use]
    pub fn hit(
        kind: RewardKind,
        claimed_at: Option<OffsetDateTime>,
        xp_delta: u64,
        meta: Map<String, Value>,
        observed_at: OffsetDateTime,
    ) -> Self {
        Self {
            patch_id: Ulid::new(),
            kind,
            claimed_at,
            xp_delta,
            hit_delta: 1,
            meta,
            observed_at,
        }
    }

    /// Folds `newer` on top of `self`. The oldest first-time claim survives,
    /// counters add up, and last-seen fields come from `newer`.
    ///
    /// The combined delta is a new patch, so it receives a fresh `patch_id`.
    #[must_use]
    pub fn coalesce(self, newer: Self) -> Self {
        Self {
            patch_id: Ulid::new(),
            kind: self.kind,
            claimed_at: self.claimed_at.or(newer.claimed_at),
            xp_delta: self.xp_delta.saturating_add(newer.xp_delta),
            hit_delta: self.hit_delta.saturating_add(newer.hit_delta),
            meta: newer.meta,
            observed_at: newer.observed_at,
        }
    }
}

/// A first-time claim that lost to a grant already present on the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationConflict {
    pub key: RewardKey,
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub record: RewardRecord,
    pub conflict: Option<ReconciliationConflict>,
}

/// Applies `delta` to the current state of `key`.
///
/// `granted_at` is first-writer-wins, `xp_total` and `hit_count` are
/// increments, `meta` and `last_hit_at` are replaced. A claim against an
/// already granted record is reported as a conflict while the counters
/// still merge.
#[must_use]
pub fn merge_record(
    old: Option<&RewardRecord>,
    key: &RewardKey,
    delta: &RewardDelta,
) -> MergeResult {
    let Some(old) = old else {
        return MergeResult {
            record: RewardRecord {
                key: key.clone(),
                kind: delta.kind,
                granted_at: delta.claimed_at,
                xp_total: delta.xp_delta,
                hit_count: delta.hit_delta,
                meta: delta.meta.clone(),
                last_hit_at: delta.observed_at,
            },
            conflict: None,
        };
    };

    let conflict = match (old.granted_at, delta.claimed_at) {
        (Some(granted_at), Some(claimed_at)) => Some(ReconciliationConflict {
            key: key.clone(),
            claimed_at,
            granted_at,
        }),
        _ => None,
    };

    MergeResult {
        record: RewardRecord {
            key: key.clone(),
            kind: old.kind,
            granted_at: old.granted_at.or(delta.claimed_at),
            xp_total: old.xp_total.saturating_add(delta.xp_delta),
            hit_count: old.hit_count.saturating_add(delta.hit_delta),
            meta: delta.meta.clone(),
            last_hit_at: delta.observed_at,
        },
        conflict,
    }
}

/// Everything still owed to the remote store for one key.
///
/// `unacked` was sent at least once without an acknowledgement, so the store
/// may already hold it; it keeps its `patch_id` and is never coalesced with
/// later activity. `queued` collects activity that has not been sent yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingDeltas {
    pub unacked: Option<RewardDelta>,
    pub queued: Option<RewardDelta>,
}

impl PendingDeltas {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unacked.is_none() && self.queued.is_none()
    }

    /// Deltas in delivery order.
    pub fn deltas(&self) -> impl Iterator<Item = &RewardDelta> {
        self.unacked.iter().chain(self.queued.iter())
    }

    /// Local view of `key`: the remote record plus whatever the store has not
    /// seen. An unacknowledged delta counts as seen once the record's
    /// `last_hit_at` has reached its `observed_at`.
    #[must_use]
    pub fn apply_to(&self, key: &RewardKey, remote: Option<RewardRecord>) -> Option<RewardRecord> {
        let mut current = remote;
        if let Some(unacked) = &self.unacked {
            let seen = current
                .as_ref()
                .is_some_and(|record| record.last_hit_at >= unacked.observed_at);
            if !seen {
                current = Some(merge_record(current.as_ref(), key, unacked).record);
            }
        }
        if let Some(queued) = &self.queued {
            current = Some(merge_record(current.as_ref(), key, queued).record);
        }
        current
    }

    /// Combines two pending sets for the same key into one read-only view.
    /// Coalesced slots get fresh patch ids, so the result is never delivered.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        fn join(lhs: Option<RewardDelta>, rhs: Option<RewardDelta>) -> Option<RewardDelta> {
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => Some(lhs.coalesce(rhs)),
                (lhs, rhs) => lhs.or(rhs),
            }
        }
        Self {
            unacked: join(self.unacked, other.unacked),
            queued: join(self.queued, other.queued),
        }
    }
}

/// Decides the local outcome of one award call against the cached record.
///
/// Returns the caller-facing outcome and the delta to ship to the remote
/// store.
#[must_use]
pub fn plan_award(
    current: Option<&RewardRecord>,
    kind: RewardKind,
    schedule: XpSchedule,
    meta: Map<String, Value>,
    now: OffsetDateTime,
) -> (AwardOutcome, RewardDelta) {
    let first_time = !current.is_some_and(RewardRecord::is_granted);
    let xp_granted = if first_time {
        schedule.first_xp
    } else {
        schedule.repeat_xp
    };
    let claimed_at = first_time.then_some(now);

    (
        AwardOutcome {
            first_time,
            xp_granted,
        },
        RewardDelta::hit(kind, claimed_at, u64::from(xp_granted), meta, now),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProgress {
    pub user_id: UserId,
    pub total_xp: u64,
    pub unlocked_achievements: BTreeSet<RewardKey>,
    pub record_count: usize,
}

#[must_use]
pub fn summarize_progress<'a>(
    user_id: &UserId,
    records: impl IntoIterator<Item = &'a RewardRecord>,
) -> UserProgress {
    let mut total_xp = 0_u64;
    let mut unlocked_achievements = BTreeSet::new();
    let mut record_count = 0_usize;

    for record in records {
        record_count += 1;
        total_xp = total_xp.saturating_add(record.xp_total);
        if record.kind == RewardKind::Achievement && record.is_granted() {
            unlocked_achievements.insert(record.key.clone());
        }
    }

    UserProgress {
        user_id: user_id.clone(),
        total_xp,
        unlocked_achievements,
        record_count,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub remote_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub reconcile_interval_ms: u64,
    pub max_key_len: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            remote_timeout_ms: 3_000,
            retry_backoff_ms: 15_000,
            reconcile_interval_ms: 60_000,
            max_key_len: DEFAULT_MAX_KEY_LEN,
        }
    }
}

impl LedgerConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when a duration or bound is zero.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for (name, value) in [
            ("remote_timeout_ms", self.remote_timeout_ms),
            ("reconcile_interval_ms", self.reconcile_interval_ms),
        ] {
            if value == 0 {
                return Err(LedgerError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        if self.max_key_len == 0 {
            return Err(LedgerError::Configuration(
                "max_key_len MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding fails or decoded
    /// values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid ledger config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

/// Decodes caller context. Anything other than a JSON object is rejected.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the payload is not valid JSON or
/// not an object.
pub fn parse_meta_json(raw: &str) -> Result<Map<String, Value>, LedgerError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| LedgerError::Validation(format!("invalid meta JSON: {err}")))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(LedgerError::Validation(
            "meta MUST be a JSON object".to_string(),
        )),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
