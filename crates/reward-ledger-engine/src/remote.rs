use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reward_ledger_core::{merge_record, RewardDelta, RewardKey, RewardRecord, UserId};
use reward_ledger_store_sqlite::{MergeReceipt, SqliteRewardStore};
use ulid::Ulid;

use crate::StoreError;

/// Authoritative, network-backed document store for reward records.
///
/// `merge` must be atomic and idempotent per `RewardDelta::patch_id`:
/// counters are increments and `granted_at` is set only when absent.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(
        &self,
        user_id: &UserId,
        key: &RewardKey,
    ) -> Result<Option<RewardRecord>, StoreError>;

    async fn merge(
        &self,
        user_id: &UserId,
        key: &RewardKey,
        delta: &RewardDelta,
    ) -> Result<MergeReceipt, StoreError>;

    async fn list(&self, user_id: &UserId) -> Result<Vec<RewardRecord>, StoreError>;
}

/// [`RemoteStore`] over a SQLite document store. Each call runs on the
/// blocking pool.
#[derive(Clone)]
pub struct SqliteRemote {
    store: Arc<Mutex<SqliteRewardStore>>,
}

impl SqliteRemote {
    #[must_use]
    pub fn new(store: SqliteRewardStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteRewardStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        });

        handle
            .await
            .map_err(|err| StoreError::Transient(format!("{operation_label} join failure: {err}")))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    async fn fetch(
        &self,
        user_id: &UserId,
        key: &RewardKey,
    ) -> Result<Option<RewardRecord>, StoreError> {
        let (user_id, key) = (user_id.clone(), key.clone());
        self.run_blocking("fetch", move |store| store.fetch(&user_id, &key))
            .await
    }

    async fn merge(
        &self,
        user_id: &UserId,
        key: &RewardKey,
        delta: &RewardDelta,
    ) -> Result<MergeReceipt, StoreError> {
        let (user_id, key, delta) = (user_id.clone(), key.clone(), delta.clone());
        self.run_blocking("merge", move |store| store.merge(&user_id, &key, &delta))
            .await
    }

    async fn list(&self, user_id: &UserId) -> Result<Vec<RewardRecord>, StoreError> {
        let user_id = user_id.clone();
        self.run_blocking("list", move |store| store.list_records(&user_id))
            .await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<(UserId, RewardKey), RewardRecord>,
    applied: HashSet<Ulid>,
}

/// In-process [`RemoteStore`] with switchable reachability and an optional
/// acknowledgement delay. A delayed merge is committed before the delay, so
/// a caller that gives up early sees the same ambiguity as a real network.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
    reachable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    merge_attempts: AtomicUsize,
    merges_applied: AtomicUsize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(None),
            merge_attempts: AtomicUsize::new(0),
            merges_applied: AtomicUsize::new(0),
        }
    }
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Merge calls received, including ones rejected while unreachable.
    #[must_use]
    pub fn merge_attempts(&self) -> usize {
        self.merge_attempts.load(Ordering::SeqCst)
    }

    /// Merges that changed a record (replays excluded).
    #[must_use]
    pub fn merges_applied(&self) -> usize {
        self.merges_applied.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn record(&self, user_id: &UserId, key: &RewardKey) -> Option<RewardRecord> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.records.get(&(user_id.clone(), key.clone())).cloned()
    }

    fn ensure_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Transient("remote store unreachable".to_string()))
        }
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(
        &self,
        user_id: &UserId,
        key: &RewardKey,
    ) -> Result<Option<RewardRecord>, StoreError> {
        self.ensure_reachable()?;
        let record = self.record(user_id, key);
        self.delay().await;
        Ok(record)
    }

    async fn merge(
        &self,
        user_id: &UserId,
        key: &RewardKey,
        delta: &RewardDelta,
    ) -> Result<MergeReceipt, StoreError> {
        self.merge_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;

        let receipt = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = (user_id.clone(), key.clone());

            if state.applied.contains(&delta.patch_id) {
                let record = state.records.get(&slot).cloned().ok_or_else(|| {
                    StoreError::Transient(format!("patch applied but {key} has no record"))
                })?;
                MergeReceipt {
                    record,
                    conflict: None,
                    replayed: true,
                }
            } else {
                let merged = merge_record(state.records.get(&slot), key, delta);
                state.records.insert(slot, merged.record.clone());
                state.applied.insert(delta.patch_id);
                self.merges_applied.fetch_add(1, Ordering::SeqCst);
                MergeReceipt {
                    record: merged.record,
                    conflict: merged.conflict,
                    replayed: false,
                }
            }
        };

        self.delay().await;
        Ok(receipt)
    }

    async fn list(&self, user_id: &UserId) -> Result<Vec<RewardRecord>, StoreError> {
        self.ensure_reachable()?;
        let mut records = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .records
                .iter()
                .filter(|((owner, _), _)| owner == user_id)
                .map(|(_, record)| record.clone())
                .collect::<Vec<_>>()
        };
        records.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
        self.delay().await;
        Ok(records)
    }
}
