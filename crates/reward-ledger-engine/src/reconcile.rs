use std::sync::{Arc, Weak};

use reward_ledger_core::{ReconciliationConflict, RewardKey, RewardRecord};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::{DeltaOutbox, RewardLedger};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attempted: usize,
    pub merged: usize,
    /// Deltas the store had already applied (an earlier ack was lost).
    pub replayed: usize,
    pub failed: usize,
    pub conflicts: Vec<ReconciliationConflict>,
    pub remaining: usize,
}

/// What one [`RewardLedger::flush_key`] call delivered.
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    pub(crate) merged: usize,
    pub(crate) replayed: usize,
    pub(crate) conflicts: Vec<ReconciliationConflict>,
    /// A delta went back into the outbox.
    pub(crate) requeued: bool,
}

impl RewardLedger {
    /// Replays every pending delta against the remote store, ignoring any
    /// active backoff. Stops at the first failure; the rest stay queued.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for key in self.pending_keys() {
            report.attempted += 1;
            let flushed = self.flush_key(&key).await;
            report.merged += flushed.merged;
            report.replayed += flushed.replayed;
            report.conflicts.extend(flushed.conflicts);
            if flushed.requeued {
                report.failed += 1;
                break;
            }
        }

        report.remaining = self.pending_keys().len();
        if report.attempted > 0 {
            info!(
                user_id = %self.user_id,
                attempted = report.attempted,
                merged = report.merged,
                replayed = report.replayed,
                conflicts = report.conflicts.len(),
                remaining = report.remaining,
                "reconciliation pass finished"
            );
        }
        report
    }

    /// Runs [`RewardLedger::reconcile`] every `reconcile_interval` until the
    /// ledger is dropped or the handle is aborted.
    #[must_use]
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let ledger: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.reconcile_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(ledger) = ledger.upgrade() else {
                    break;
                };
                ledger.reconcile().await;
            }
        })
    }

    /// Delivers everything pending for `key`: the unacknowledged delta
    /// first, then the queued one, each as its own patch. On failure the
    /// delta is put back and the ledger backs off direct writes.
    ///
    /// Only one delivery per key is in flight at a time.
    pub(crate) async fn flush_key(&self, key: &RewardKey) -> FlushOutcome {
        let _flushing = self.flush_locks.lock(key).await;
        let mut outcome = FlushOutcome::default();

        loop {
            let delta = match self.outbox.take(&self.user_id, key) {
                Ok(Some(delta)) => delta,
                Ok(None) => break,
                Err(err) => {
                    warn!(key = %key, error = %err, "outbox take failed");
                    outcome.requeued = true;
                    break;
                }
            };

            match self
                .remote_call(self.remote.merge(&self.user_id, key, &delta))
                .await
            {
                Ok(receipt) => {
                    self.clear_backoff();
                    outcome.merged += 1;
                    if receipt.replayed {
                        outcome.replayed += 1;
                    }
                    if let Some(conflict) = receipt.conflict {
                        warn!(
                            key = %key,
                            claimed_at = %conflict.claimed_at,
                            granted_at = %conflict.granted_at,
                            "first-time claim lost to an earlier grant; counters merged"
                        );
                        outcome.conflicts.push(conflict);
                    }
                    self.adopt_remote(key, receipt.record).await;
                }
                Err(err) => {
                    self.enter_backoff();
                    warn!(
                        key = %key,
                        patch_id = %delta.patch_id,
                        error = %err,
                        "remote merge failed; delta re-queued"
                    );
                    if let Err(restore_err) = self.outbox.restore(&self.user_id, key, delta) {
                        error!(key = %key, error = %restore_err, "failed to re-queue reward delta");
                    }
                    outcome.requeued = true;
                    break;
                }
            }
        }

        outcome
    }

    /// Brings the cache in line with the store once nothing newer is
    /// pending locally. Local grants already shown are never reverted, and
    /// counters never move backwards.
    async fn adopt_remote(&self, key: &RewardKey, record: RewardRecord) {
        let _guard = self.locks.lock(key).await;
        match self.outbox.peek(&self.user_id, key) {
            Ok(pending) if pending.is_empty() => {
                let local = self.cache.get(key);
                // A later flush may already have landed a newer record.
                if local
                    .as_ref()
                    .is_some_and(|local| local.hit_count > record.hit_count)
                {
                    return;
                }
                let mut record = record;
                if record.granted_at.is_none() {
                    record.granted_at = local.and_then(|local| local.granted_at);
                }
                self.cache.put(record);
            }
            Ok(_) => {}
            Err(err) => warn!(key = %key, error = %err, "outbox read failed"),
        }
    }
}
