use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reward_ledger_core::RewardKey;
use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Per-key async mutexes. Calls on the same key queue up; different keys
/// never contend. A key's slot lives only while someone holds or waits on it.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    slots: Mutex<HashMap<RewardKey, Slot>>,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, key: &RewardKey) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(slot.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    fn holders(&self, key: &RewardKey) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Arc::strong_count)
    }
}

pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: RewardKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Waiters clone the slot under this map lock, so a count of one
        // here means nobody else can reach it.
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}
