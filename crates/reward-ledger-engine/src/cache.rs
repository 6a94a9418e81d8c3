use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use reward_ledger_core::{RewardKey, RewardRecord};

/// In-process mirror of reward records for the current session.
///
/// Advisory only: it answers "has this fired?" without a network round-trip,
/// and the remote store stays the source of truth.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: RwLock<HashMap<RewardKey, RewardRecord>>,
}

impl LocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &RewardKey) -> Option<RewardRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Replaces the entry for `record.key`.
    pub fn put(&self, record: RewardRecord) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(record.key.clone(), record);
    }

    /// All cached records ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RewardRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut records = entries.values().cloned().collect::<Vec<_>>();
        records.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
