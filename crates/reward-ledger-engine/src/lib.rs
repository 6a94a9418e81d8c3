//! Reward ledger orchestration.
//!
//! A [`RewardLedger`] is bound to one user. Every award is decided against
//! the [`LocalCache`], queued in a [`DeltaOutbox`] and then merged into the
//! [`RemoteStore`] under a bounded timeout. Storage failures never reach the
//! caller; only malformed input does, and it is reported before any future
//! is created.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use reward_ledger_core::{
    merge_record, now_utc, plan_award, summarize_progress, AwardOutcome, LedgerConfig,
    LedgerError, PendingDeltas, RewardKey, RewardKind, RewardRecord, UserId, UserProgress,
    XpSchedule,
};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

mod cache;
mod locks;
mod outbox;
mod reconcile;
mod remote;
mod screen;

pub use cache::LocalCache;
pub use outbox::{DeltaOutbox, MemoryOutbox, SqliteOutbox};
pub use reconcile::ReconcileReport;
pub use remote::{MemoryRemoteStore, RemoteStore, SqliteRemote};
pub use reward_ledger_store_sqlite::MergeReceipt;
pub use screen::{award_on_success, use_award_on_enter, EnterHookOptions, SuccessHookOptions};

use locks::KeyLocks;
use outbox::SpillOutbox;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store operation timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnterOptions {
    pub xp_on_enter: u32,
    pub repeat_xp: u32,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuccessOptions {
    pub xp_on_success: u32,
    /// XP for repeated successes; zero unless the caller opts in.
    pub repeat_xp: u32,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AchievementOptions {
    pub xp: u32,
    /// Analytics label, stored as `meta.sub`.
    pub sub: Option<String>,
    pub meta: Map<String, Value>,
}

pub struct RewardLedger {
    user_id: UserId,
    config: LedgerConfig,
    cache: LocalCache,
    remote: Arc<dyn RemoteStore>,
    outbox: SpillOutbox,
    locks: KeyLocks,
    flush_locks: KeyLocks,
    backoff_until: Mutex<Option<Instant>>,
}

impl RewardLedger {
    /// Deltas `outbox` fails to persist are held in memory until the next
    /// reconciliation delivers them.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `config` is invalid.
    pub fn new(
        user_id: UserId,
        remote: Arc<dyn RemoteStore>,
        outbox: Arc<dyn DeltaOutbox>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            user_id,
            config,
            cache: LocalCache::new(),
            remote,
            outbox: SpillOutbox::new(outbox),
            locks: KeyLocks::default(),
            flush_locks: KeyLocks::default(),
            backoff_until: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] for empty or over-long keys.
    pub fn parse_key(&self, raw: &str) -> Result<RewardKey, LedgerError> {
        RewardKey::parse(raw, self.config.max_key_len)
    }

    /// Records a screen entry. Safe to call on every mount: the first call
    /// pays `xp_on_enter`, later calls pay `repeat_xp`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a malformed key. The returned
    /// future itself cannot fail.
    pub fn award_on_enter(
        &self,
        key: &str,
        options: EnterOptions,
    ) -> Result<impl Future<Output = AwardOutcome> + Send + '_, LedgerError> {
        let key = self.parse_key(key)?;
        let schedule = XpSchedule {
            first_xp: options.xp_on_enter,
            repeat_xp: options.repeat_xp,
        };
        Ok(self.award(key, RewardKind::Enter, schedule, options.meta))
    }

    /// Records a completed task. Retries never re-grant `xp_on_success`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a malformed key.
    pub fn award_on_success(
        &self,
        key: &str,
        options: SuccessOptions,
    ) -> Result<impl Future<Output = AwardOutcome> + Send + '_, LedgerError> {
        let key = self.parse_key(key)?;
        let schedule = XpSchedule {
            first_xp: options.xp_on_success,
            repeat_xp: options.repeat_xp,
        };
        Ok(self.award(key, RewardKind::Success, schedule, options.meta))
    }

    /// Unlocks a named achievement once per user, whichever screen asks.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for a malformed achievement id.
    pub fn award_achievement(
        &self,
        achievement_id: &str,
        options: AchievementOptions,
    ) -> Result<impl Future<Output = AwardOutcome> + Send + '_, LedgerError> {
        let key = self.parse_key(achievement_id)?;
        let mut meta = options.meta;
        if let Some(sub) = options.sub {
            meta.insert("sub".to_string(), Value::String(sub));
        }
        let schedule = XpSchedule {
            first_xp: options.xp,
            repeat_xp: 0,
        };
        Ok(self.award(key, RewardKind::Achievement, schedule, meta))
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] for a malformed key.
    pub fn record(&self, key: &str) -> Result<Option<RewardRecord>, LedgerError> {
        let key = self.parse_key(key)?;
        Ok(self.cache.get(&key))
    }

    #[must_use]
    pub fn records(&self) -> Vec<RewardRecord> {
        self.cache.snapshot()
    }

    /// Deltas recorded locally and not yet acknowledged by the remote store.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the outbox cannot be read.
    pub fn pending_deltas(&self) -> Result<Vec<(RewardKey, PendingDeltas)>, StoreError> {
        self.outbox.pending(&self.user_id)
    }

    #[must_use]
    pub fn progress(&self) -> UserProgress {
        summarize_progress(&self.user_id, &self.cache.snapshot())
    }

    /// Cold start: load the remote records into the cache, then replay
    /// whatever the outbox still holds.
    pub async fn start(&self) -> ReconcileReport {
        match self.hydrate().await {
            Ok(loaded) => info!(user_id = %self.user_id, loaded, "local cache hydrated"),
            Err(err) => {
                self.enter_backoff();
                warn!(user_id = %self.user_id, error = %err, "cache hydration failed; starting from local state");
            }
        }
        self.reconcile().await
    }

    /// Loads remote records for keys the cache does not know yet, applying
    /// pending local deltas on top. Returns the number of keys loaded.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the remote listing fails or times out.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let records = self.remote_call(self.remote.list(&self.user_id)).await?;
        let mut loaded = 0_usize;

        for record in records {
            let key = record.key.clone();
            let _guard = self.locks.lock(&key).await;
            if self.cache.get(&key).is_none() {
                if let Some(view) = self.local_view(&key, Some(record)) {
                    self.cache.put(view);
                    loaded += 1;
                }
            }
        }

        for key in self.pending_keys() {
            let _guard = self.locks.lock(&key).await;
            if self.cache.get(&key).is_none() {
                if let Some(view) = self.local_view(&key, None) {
                    self.cache.put(view);
                    loaded += 1;
                }
            }
        }

        Ok(loaded)
    }

    pub(crate) async fn award(
        &self,
        key: RewardKey,
        kind: RewardKind,
        schedule: XpSchedule,
        meta: Map<String, Value>,
    ) -> AwardOutcome {
        let outcome = {
            let _guard = self.locks.lock(&key).await;

            let current = match self.cache.get(&key) {
                Some(record) => Some(record),
                None => self.load_missing(&key).await,
            };

            let (outcome, delta) = plan_award(current.as_ref(), kind, schedule, meta, now_utc());
            self.cache
                .put(merge_record(current.as_ref(), &key, &delta).record);

            if let Err(err) = self.outbox.push(&self.user_id, &key, delta) {
                error!(key = %key, error = %err, "reward delta could not be queued");
            }
            outcome
        };

        debug!(
            user_id = %self.user_id,
            key = %key,
            first_time = outcome.first_time,
            xp_granted = outcome.xp_granted,
            "reward recorded locally"
        );

        if self.in_backoff() {
            debug!(key = %key, "remote store backing off; delta stays queued");
        } else {
            self.flush_key(&key).await;
        }

        outcome
    }

    /// Builds the cache entry for a key the cache has not seen: the remote
    /// record (if reachable in time) plus any pending local deltas.
    async fn load_missing(&self, key: &RewardKey) -> Option<RewardRecord> {
        let remote = if self.in_backoff() {
            None
        } else {
            match self
                .remote_call(self.remote.fetch(&self.user_id, key))
                .await
            {
                Ok(record) => record,
                Err(err) => {
                    self.enter_backoff();
                    warn!(key = %key, error = %err, "remote fetch failed; deciding locally");
                    None
                }
            }
        };

        let view = self.local_view(key, remote);
        if let Some(record) = &view {
            self.cache.put(record.clone());
        }
        view
    }

    fn local_view(&self, key: &RewardKey, remote: Option<RewardRecord>) -> Option<RewardRecord> {
        match self.outbox.peek(&self.user_id, key) {
            Ok(pending) => pending.apply_to(key, remote),
            Err(err) => {
                warn!(key = %key, error = %err, "outbox read failed");
                remote
            }
        }
    }

    fn pending_keys(&self) -> Vec<RewardKey> {
        match self.outbox.pending(&self.user_id) {
            Ok(pending) => pending.into_iter().map(|(key, _)| key).collect(),
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "outbox listing failed");
                Vec::new()
            }
        }
    }

    async fn remote_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.remote_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::TimedOut {
                after_ms: self.config.remote_timeout_ms,
            }),
        }
    }

    fn in_backoff(&self) -> bool {
        let until = self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        until.is_some_and(|deadline| Instant::now() < deadline)
    }

    fn enter_backoff(&self) {
        if self.config.retry_backoff_ms == 0 {
            return;
        }
        let mut until = self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *until = Some(Instant::now() + self.config.retry_backoff());
    }

    fn clear_backoff(&self) {
        let mut until = self
            .backoff_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *until = None;
    }
}
