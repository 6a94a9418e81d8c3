use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use reward_ledger_core::{PendingDeltas, RewardDelta, RewardKey, UserId};
use reward_ledger_store_sqlite::SqliteDeltaOutbox;
use tracing::warn;

use crate::StoreError;

/// Deltas recorded locally that the remote store has not acknowledged.
///
/// Each (user, key) holds at most two deltas. `push` folds newer activity
/// into the queued one. `restore` puts a delta that was sent without an
/// acknowledgement into the unacked slot untouched, so its `patch_id` still
/// matches whatever the store may have applied. `take` hands out the unacked
/// delta before the queued one.
pub trait DeltaOutbox: Send + Sync {
    fn push(&self, user_id: &UserId, key: &RewardKey, delta: RewardDelta) -> Result<(), StoreError>;

    fn restore(&self, user_id: &UserId, key: &RewardKey, delta: RewardDelta)
        -> Result<(), StoreError>;

    fn take(&self, user_id: &UserId, key: &RewardKey) -> Result<Option<RewardDelta>, StoreError>;

    fn peek(&self, user_id: &UserId, key: &RewardKey) -> Result<PendingDeltas, StoreError>;

    /// Keys with pending work, in key order.
    fn pending(&self, user_id: &UserId) -> Result<Vec<(RewardKey, PendingDeltas)>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryOutbox {
    pending: Mutex<BTreeMap<(UserId, RewardKey), PendingDeltas>>,
}

impl MemoryOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeltaOutbox for MemoryOutbox {
    fn push(&self, user_id: &UserId, key: &RewardKey, delta: RewardDelta) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = pending.entry((user_id.clone(), key.clone())).or_default();
        entry.queued = Some(match entry.queued.take() {
            Some(existing) => existing.coalesce(delta),
            None => delta,
        });
        Ok(())
    }

    fn restore(
        &self,
        user_id: &UserId,
        key: &RewardKey,
        delta: RewardDelta,
    ) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = pending.entry((user_id.clone(), key.clone())).or_default();
        if entry.unacked.is_none() {
            entry.unacked = Some(delta);
        } else {
            entry.queued = Some(match entry.queued.take() {
                Some(newer) => delta.coalesce(newer),
                None => delta,
            });
        }
        Ok(())
    }

    fn take(&self, user_id: &UserId, key: &RewardKey) -> Result<Option<RewardDelta>, StoreError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = (user_id.clone(), key.clone());
        let Some(entry) = pending.get_mut(&slot) else {
            return Ok(None);
        };
        let taken = entry.unacked.take().or_else(|| entry.queued.take());
        if entry.is_empty() {
            pending.remove(&slot);
        }
        Ok(taken)
    }

    fn peek(&self, user_id: &UserId, key: &RewardKey) -> Result<PendingDeltas, StoreError> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(pending
            .get(&(user_id.clone(), key.clone()))
            .cloned()
            .unwrap_or_default())
    }

    fn pending(&self, user_id: &UserId) -> Result<Vec<(RewardKey, PendingDeltas)>, StoreError> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(pending
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|((_, key), deltas)| (key.clone(), deltas.clone()))
            .collect())
    }
}

/// [`DeltaOutbox`] persisted in an on-device SQLite file, so queued rewards
/// survive an app restart.
pub struct SqliteOutbox {
    outbox: Mutex<SqliteDeltaOutbox>,
}

impl SqliteOutbox {
    #[must_use]
    pub fn new(outbox: SqliteDeltaOutbox) -> Self {
        Self {
            outbox: Mutex::new(outbox),
        }
    }

    fn with_outbox<T>(
        &self,
        op: impl FnOnce(&mut SqliteDeltaOutbox) -> anyhow::Result<T>,
    ) -> Result<T, StoreError> {
        let mut guard = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut guard).map_err(StoreError::from)
    }
}

impl DeltaOutbox for SqliteOutbox {
    fn push(&self, user_id: &UserId, key: &RewardKey, delta: RewardDelta) -> Result<(), StoreError> {
        self.with_outbox(|outbox| outbox.push(user_id, key, delta))
    }

    fn restore(
        &self,
        user_id: &UserId,
        key: &RewardKey,
        delta: RewardDelta,
    ) -> Result<(), StoreError> {
        self.with_outbox(|outbox| outbox.restore(user_id, key, delta))
    }

    fn take(&self, user_id: &UserId, key: &RewardKey) -> Result<Option<RewardDelta>, StoreError> {
        self.with_outbox(|outbox| outbox.take(user_id, key))
    }

    fn peek(&self, user_id: &UserId, key: &RewardKey) -> Result<PendingDeltas, StoreError> {
        self.with_outbox(|outbox| outbox.peek(user_id, key))
    }

    fn pending(&self, user_id: &UserId) -> Result<Vec<(RewardKey, PendingDeltas)>, StoreError> {
        self.with_outbox(|outbox| outbox.pending(user_id))
    }
}

/// Wraps the configured outbox with an in-memory spill area. Writes the
/// durable outbox rejects land in memory instead, and the reconciler drains
/// both. Spilled deltas do not survive a restart.
///
/// Unacked deltas from either side are handed out before any queued one, so
/// a restored delta always finds an empty unacked slot.
pub(crate) struct SpillOutbox {
    durable: Arc<dyn DeltaOutbox>,
    spill: MemoryOutbox,
}

impl SpillOutbox {
    pub(crate) fn new(durable: Arc<dyn DeltaOutbox>) -> Self {
        Self {
            durable,
            spill: MemoryOutbox::new(),
        }
    }
}

impl DeltaOutbox for SpillOutbox {
    fn push(&self, user_id: &UserId, key: &RewardKey, delta: RewardDelta) -> Result<(), StoreError> {
        if let Err(err) = self.durable.push(user_id, key, delta.clone()) {
            warn!(key = %key, error = %err, "outbox write failed; holding delta in memory");
            return self.spill.push(user_id, key, delta);
        }
        Ok(())
    }

    fn restore(
        &self,
        user_id: &UserId,
        key: &RewardKey,
        delta: RewardDelta,
    ) -> Result<(), StoreError> {
        let durable_free = self
            .durable
            .peek(user_id, key)
            .is_ok_and(|pending| pending.unacked.is_none());
        if durable_free {
            match self.durable.restore(user_id, key, delta.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(key = %key, error = %err, "outbox restore failed; holding delta in memory");
                }
            }
        }
        self.spill.restore(user_id, key, delta)
    }

    fn take(&self, user_id: &UserId, key: &RewardKey) -> Result<Option<RewardDelta>, StoreError> {
        let durable_unacked = match self.durable.peek(user_id, key) {
            Ok(pending) => pending.unacked.is_some(),
            Err(err) => {
                warn!(key = %key, error = %err, "outbox read failed; checking memory");
                return self.spill.take(user_id, key);
            }
        };
        if !durable_unacked && self.spill.peek(user_id, key)?.unacked.is_some() {
            return self.spill.take(user_id, key);
        }
        match self.durable.take(user_id, key) {
            Ok(Some(delta)) => return Ok(Some(delta)),
            Ok(None) => {}
            Err(err) => warn!(key = %key, error = %err, "outbox take failed; checking memory"),
        }
        self.spill.take(user_id, key)
    }

    fn peek(&self, user_id: &UserId, key: &RewardKey) -> Result<PendingDeltas, StoreError> {
        let spilled = self.spill.peek(user_id, key)?;
        match self.durable.peek(user_id, key) {
            Ok(durable) => Ok(durable.combine(spilled)),
            Err(err) => {
                warn!(key = %key, error = %err, "outbox read failed");
                Ok(spilled)
            }
        }
    }

    fn pending(&self, user_id: &UserId) -> Result<Vec<(RewardKey, PendingDeltas)>, StoreError> {
        let durable = match self.durable.pending(user_id) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "outbox listing failed");
                Vec::new()
            }
        };

        let mut merged: BTreeMap<RewardKey, PendingDeltas> = durable.into_iter().collect();
        for (key, spilled) in self.spill.pending(user_id)? {
            let entry = merged.remove(&key).unwrap_or_default();
            merged.insert(key, entry.combine(spilled));
        }
        Ok(merged.into_iter().collect())
    }
}
