use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reward_ledger_core::{
    LedgerConfig, LedgerError, PendingDeltas, RewardDelta, RewardKey, RewardRecord, UserId,
};
use reward_ledger_engine::{
    award_on_success, use_award_on_enter, AchievementOptions, DeltaOutbox, EnterHookOptions,
    EnterOptions, MemoryOutbox, MemoryRemoteStore, RemoteStore, RewardLedger, SqliteOutbox,
    SqliteRemote, StoreError, SuccessHookOptions, SuccessOptions,
};
use reward_ledger_store_sqlite::{SqliteDeltaOutbox, SqliteRewardStore};
use serde_json::Value;
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn must_some<T>(value: Option<T>, context: &str) -> T {
    match value {
        Some(value) => value,
        None => panic!("expected value: {context}"),
    }
}

fn user() -> UserId {
    must(UserId::parse("student-7"))
}

fn key(raw: &str) -> RewardKey {
    must(RewardKey::parse(raw, reward_ledger_core::DEFAULT_MAX_KEY_LEN))
}

fn ledger_with(
    remote: &Arc<MemoryRemoteStore>,
    outbox: Arc<dyn DeltaOutbox>,
    config: LedgerConfig,
) -> Arc<RewardLedger> {
    let remote: Arc<dyn RemoteStore> = Arc::<MemoryRemoteStore>::clone(remote);
    Arc::new(must(RewardLedger::new(user(), remote, outbox, config)))
}

fn ledger(remote: &Arc<MemoryRemoteStore>) -> Arc<RewardLedger> {
    ledger_with(remote, Arc::new(MemoryOutbox::new()), LedgerConfig::default())
}

fn remote_record(remote: &MemoryRemoteStore, raw: &str) -> RewardRecord {
    must_some(remote.record(&user(), &key(raw)), raw)
}

fn enter(xp_on_enter: u32, repeat_xp: u32) -> EnterOptions {
    EnterOptions {
        xp_on_enter,
        repeat_xp,
        ..EnterOptions::default()
    }
}

fn success(xp_on_success: u32) -> SuccessOptions {
    SuccessOptions {
        xp_on_success,
        ..SuccessOptions::default()
    }
}

fn temp_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("reward-ledger-{label}-{}.sqlite3", Ulid::new()))
}

/// Outbox whose writes always fail and which never holds anything.
struct BrokenOutbox;

impl DeltaOutbox for BrokenOutbox {
    fn push(&self, _: &UserId, _: &RewardKey, _: RewardDelta) -> Result<(), StoreError> {
        Err(StoreError::Transient("outbox file is read-only".to_string()))
    }

    fn restore(&self, _: &UserId, _: &RewardKey, _: RewardDelta) -> Result<(), StoreError> {
        Err(StoreError::Transient("outbox file is read-only".to_string()))
    }

    fn take(&self, _: &UserId, _: &RewardKey) -> Result<Option<RewardDelta>, StoreError> {
        Ok(None)
    }

    fn peek(&self, _: &UserId, _: &RewardKey) -> Result<PendingDeltas, StoreError> {
        Ok(PendingDeltas::default())
    }

    fn pending(&self, _: &UserId) -> Result<Vec<(RewardKey, PendingDeltas)>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn repeated_entries_pay_first_then_repeat_xp() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ledger = ledger(&remote);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await);
    }

    assert!(outcomes[0].first_time);
    assert_eq!(outcomes[0].xp_granted, 10);
    assert!(outcomes[1..].iter().all(|outcome| !outcome.first_time));
    assert!(outcomes[1..].iter().all(|outcome| outcome.xp_granted == 5));

    let record = remote_record(&remote, "N5_Escritura:enter");
    assert_eq!(record.xp_total, 20);
    assert_eq!(record.hit_count, 3);
    assert!(record.is_granted());

    let cached = must_some(must(ledger.record("N5_Escritura:enter")), "cached record");
    assert_eq!(cached.xp_total, 20);
    assert_eq!(cached.granted_at, record.granted_at);
}

#[tokio::test]
async fn retried_success_grants_its_xp_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ledger = ledger(&remote);

    let mut first_times = 0;
    for _ in 0..5 {
        let outcome = must(ledger.award_on_success("N5_Quiz:success", success(30))).await;
        if outcome.first_time {
            first_times += 1;
            assert_eq!(outcome.xp_granted, 30);
        } else {
            assert_eq!(outcome.xp_granted, 0);
        }
    }

    assert_eq!(first_times, 1);
    let record = remote_record(&remote, "N5_Quiz:success");
    assert_eq!(record.xp_total, 30);
    assert_eq!(record.hit_count, 5);
    assert_eq!(ledger.progress().total_xp, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_on_one_key_yield_a_single_first_time() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ledger = ledger(&remote);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await
        }));
    }

    let mut first_times = 0;
    for handle in handles {
        if must(handle.await).first_time {
            first_times += 1;
        }
    }
    assert_eq!(first_times, 1);

    let record = remote_record(&remote, "N5_Escritura:enter");
    assert_eq!(record.hit_count, 16);
    assert_eq!(record.xp_total, 10 + 15 * 5);

    let cached = must_some(must(ledger.record("N5_Escritura:enter")), "cached record");
    assert_eq!(cached.hit_count, 16);
}

#[tokio::test]
async fn keys_are_independent() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ledger = ledger(&remote);

    let first = must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    let other = must(ledger.award_on_enter("N5_Lectura:enter", enter(10, 5))).await;
    let again = must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;

    assert!(first.first_time);
    assert!(other.first_time);
    assert!(!again.first_time);
    assert_eq!(remote_record(&remote, "N5_Lectura:enter").hit_count, 1);
    assert_eq!(remote_record(&remote, "N5_Escritura:enter").hit_count, 2);
}

#[tokio::test]
async fn offline_awards_replay_as_one_merge_matching_the_online_run() {
    let offline_remote = Arc::new(MemoryRemoteStore::new());
    offline_remote.set_reachable(false);
    let offline = ledger(&offline_remote);

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(must(offline.award_on_enter("N5_Escritura:enter", enter(10, 5))).await);
    }
    assert!(outcomes[0].first_time);
    assert_eq!(outcomes.iter().filter(|outcome| outcome.first_time).count(), 1);
    assert!(offline_remote.record(&user(), &key("N5_Escritura:enter")).is_none());

    offline_remote.set_reachable(true);
    let report = offline.reconcile().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(offline_remote.merges_applied(), 1);

    let online_remote = Arc::new(MemoryRemoteStore::new());
    let online = ledger(&online_remote);
    for _ in 0..5 {
        must(online.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    }

    let replayed = remote_record(&offline_remote, "N5_Escritura:enter");
    let direct = remote_record(&online_remote, "N5_Escritura:enter");
    assert_eq!(replayed.hit_count, 5);
    assert_eq!(replayed.xp_total, 30);
    assert_eq!(replayed.hit_count, direct.hit_count);
    assert_eq!(replayed.xp_total, direct.xp_total);
    assert_eq!(replayed.is_granted(), direct.is_granted());
}

#[tokio::test]
async fn reconcile_stops_at_the_first_failure() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_reachable(false);
    let ledger = ledger(&remote);

    must(ledger.award_on_enter("a:enter", enter(1, 1))).await;
    must(ledger.award_on_enter("b:enter", enter(1, 1))).await;

    let attempts_before = remote.merge_attempts();
    let report = ledger.reconcile().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(remote.merge_attempts(), attempts_before + 1);
}

#[tokio::test]
async fn hooks_share_one_achievement_across_screens() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ledger = ledger(&remote);

    let handle = must(use_award_on_enter(
        &ledger,
        "N5_Escritura:enter",
        EnterHookOptions {
            xp_on_enter: 10,
            achievement_id: Some("senseidevista".to_string()),
            achievement_sub: Some("N5_Escritura".to_string()),
            ..EnterHookOptions::default()
        },
    ));
    must(handle.await);

    let outcome = must(award_on_success(
        &ledger,
        "N5_Quiz:success",
        SuccessHookOptions {
            xp_on_success: 30,
            achievement_id: Some("senseidevista".to_string()),
            ..SuccessHookOptions::default()
        },
    ))
    .await;
    assert!(outcome.first_time);
    assert_eq!(outcome.xp_granted, 30);

    let direct = must(ledger.award_achievement("senseidevista", AchievementOptions::default())).await;
    assert!(!direct.first_time);

    let achievement = remote_record(&remote, "senseidevista");
    assert_eq!(achievement.hit_count, 3);
    assert_eq!(achievement.xp_total, 0);

    let progress = ledger.progress();
    assert_eq!(progress.total_xp, 40);
    assert!(progress
        .unlocked_achievements
        .contains(&key("senseidevista")));
}

#[tokio::test]
async fn achievement_sub_is_stored_in_meta() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let ledger = ledger(&remote);

    let outcome = must(ledger.award_achievement(
        "senseidevista",
        AchievementOptions {
            xp: 50,
            sub: Some("N5_Escritura".to_string()),
            ..AchievementOptions::default()
        },
    ))
    .await;
    assert!(outcome.first_time);
    assert_eq!(outcome.xp_granted, 50);

    let record = remote_record(&remote, "senseidevista");
    assert_eq!(
        record.meta.get("sub"),
        Some(&Value::String("N5_Escritura".to_string()))
    );
}

#[tokio::test]
async fn malformed_keys_fail_before_any_work() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let config = LedgerConfig {
        max_key_len: 8,
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(&remote, Arc::new(MemoryOutbox::new()), config);

    assert!(matches!(
        ledger.award_on_enter("", EnterOptions::default()),
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        ledger.award_on_success("   ", SuccessOptions::default()),
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        ledger.award_achievement("much-too-long", AchievementOptions::default()),
        Err(LedgerError::Validation(_))
    ));
    assert!(matches!(
        use_award_on_enter(
            &ledger,
            "ok",
            EnterHookOptions {
                achievement_id: Some(String::new()),
                ..EnterHookOptions::default()
            },
        ),
        Err(LedgerError::Validation(_))
    ));

    assert_eq!(remote.merge_attempts(), 0);
    assert!(ledger.cache().is_empty());
}

#[tokio::test]
async fn timed_out_merge_is_replayed_not_reapplied() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_latency(Some(Duration::from_millis(300)));
    let config = LedgerConfig {
        remote_timeout_ms: 50,
        retry_backoff_ms: 0,
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(&remote, Arc::new(MemoryOutbox::new()), config);

    let outcome = must(ledger.award_on_success("N5_Quiz:success", success(30))).await;
    assert!(outcome.first_time);
    assert_eq!(remote.merges_applied(), 1);

    remote.set_latency(None);
    let report = ledger.reconcile().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.replayed, 1);
    assert_eq!(remote.merges_applied(), 1);

    let record = remote_record(&remote, "N5_Quiz:success");
    assert_eq!(record.hit_count, 1);
    assert_eq!(record.xp_total, 30);
}

#[tokio::test]
async fn awards_after_an_ambiguous_timeout_are_applied_exactly_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let outbox = Arc::new(MemoryOutbox::new());
    let config = LedgerConfig {
        remote_timeout_ms: 50,
        ..LedgerConfig::default()
    };
    let shared: Arc<dyn DeltaOutbox> = Arc::<MemoryOutbox>::clone(&outbox);
    let ledger = ledger_with(&remote, shared, config.clone());

    must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    assert_eq!(remote.merges_applied(), 1);

    // The store commits the second hit but the acknowledgement times out.
    remote.set_latency(Some(Duration::from_millis(300)));
    must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    assert_eq!(remote.merges_applied(), 2);

    // Backing off now, so the third hit stays queued beside the unacked one.
    must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    let pending = must(ledger.pending_deltas());
    assert_eq!(pending.len(), 1);
    assert!(pending[0].1.unacked.is_some());
    assert!(pending[0].1.queued.is_some());

    remote.set_latency(None);

    let shared: Arc<dyn DeltaOutbox> = Arc::<MemoryOutbox>::clone(&outbox);
    let other_session = ledger_with(&remote, shared, config);
    must(other_session.hydrate().await);
    let view = must_some(must(other_session.record("N5_Escritura:enter")), "hydrated view");
    assert_eq!(view.hit_count, 3);
    assert_eq!(view.xp_total, 20);

    let report = ledger.reconcile().await;
    assert_eq!(report.merged, 2);
    assert_eq!(report.replayed, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(remote.merges_applied(), 3);

    let stored = remote_record(&remote, "N5_Escritura:enter");
    assert_eq!(stored.hit_count, 3);
    assert_eq!(stored.xp_total, 20);

    let local = must_some(must(ledger.record("N5_Escritura:enter")), "local record");
    assert_eq!(local.hit_count, 3);
    assert_eq!(local.xp_total, 20);
}

#[tokio::test]
async fn rewards_survive_an_unwritable_outbox() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_reachable(false);
    let ledger = ledger_with(&remote, Arc::new(BrokenOutbox), LedgerConfig::default());

    let outcome = must(ledger.award_on_success("N5_Quiz:success", success(30))).await;
    assert!(outcome.first_time);

    let pending = must(ledger.pending_deltas());
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, key("N5_Quiz:success"));

    remote.set_reachable(true);
    let report = ledger.reconcile().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.remaining, 0);

    let record = remote_record(&remote, "N5_Quiz:success");
    assert_eq!(record.hit_count, 1);
    assert_eq!(record.xp_total, 30);
    assert!(record.is_granted());
}

#[tokio::test]
async fn cold_start_and_cache_miss_both_see_remote_grants() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let first_session = ledger(&remote);
    must(first_session.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    drop(first_session);

    let hydrated = ledger(&remote);
    let report = hydrated.start().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(hydrated.cache().len(), 1);
    let outcome = must(hydrated.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    assert!(!outcome.first_time);
    assert_eq!(outcome.xp_granted, 5);

    let cold = ledger(&remote);
    let outcome = must(cold.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    assert!(!outcome.first_time);
    assert_eq!(remote_record(&remote, "N5_Escritura:enter").hit_count, 3);
}

#[tokio::test]
async fn cross_device_claims_are_reported_as_conflicts() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let phone = ledger(&remote);
    let tablet = ledger(&remote);

    remote.set_reachable(false);
    let tablet_outcome = must(tablet.award_on_success("N5_Quiz:success", success(30))).await;
    assert!(tablet_outcome.first_time);

    remote.set_reachable(true);
    let phone_outcome = must(phone.award_on_success("N5_Quiz:success", success(30))).await;
    assert!(phone_outcome.first_time);

    let report = tablet.reconcile().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].key, key("N5_Quiz:success"));

    let record = remote_record(&remote, "N5_Quiz:success");
    assert_eq!(record.hit_count, 2);
    assert_eq!(record.xp_total, 60);
    assert_eq!(Some(report.conflicts[0].granted_at), record.granted_at);
}

#[tokio::test]
async fn background_reconciler_delivers_queued_deltas() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_reachable(false);
    let config = LedgerConfig {
        reconcile_interval_ms: 20,
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(&remote, Arc::new(MemoryOutbox::new()), config);

    must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    let reconciler = ledger.spawn_reconciler();

    remote.set_reachable(true);
    let mut delivered = false;
    for _ in 0..50 {
        if remote.record(&user(), &key("N5_Escritura:enter")).is_some() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    reconciler.abort();

    assert!(delivered);
    assert_eq!(remote_record(&remote, "N5_Escritura:enter").xp_total, 10);
}

#[tokio::test]
async fn queued_rewards_survive_a_restart() {
    let outbox_path = temp_path("outbox");
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_reachable(false);

    {
        let outbox = must(SqliteDeltaOutbox::open(&outbox_path));
        must(outbox.migrate());
        let ledger = ledger_with(&remote, Arc::new(SqliteOutbox::new(outbox)), LedgerConfig::default());
        must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
        must(ledger.award_on_enter("N5_Escritura:enter", enter(10, 5))).await;
    }

    remote.set_reachable(true);
    let outbox = must(SqliteDeltaOutbox::open(&outbox_path));
    must(outbox.migrate());
    let ledger = ledger_with(&remote, Arc::new(SqliteOutbox::new(outbox)), LedgerConfig::default());

    let report = ledger.start().await;
    assert_eq!(report.merged, 1);
    assert_eq!(report.remaining, 0);

    let record = remote_record(&remote, "N5_Escritura:enter");
    assert_eq!(record.hit_count, 2);
    assert_eq!(record.xp_total, 15);
    assert!(record.is_granted());
}

#[tokio::test]
async fn sqlite_backed_ledger_keeps_grants_across_sessions() {
    let store_path = temp_path("store");
    let outbox_path = temp_path("outbox");

    let open = || {
        let store = must(SqliteRewardStore::open(&store_path));
        must(store.migrate());
        let outbox = must(SqliteDeltaOutbox::open(&outbox_path));
        must(outbox.migrate());
        Arc::new(must(RewardLedger::new(
            user(),
            Arc::new(SqliteRemote::new(store)),
            Arc::new(SqliteOutbox::new(outbox)),
            LedgerConfig::default(),
        )))
    };

    let first = open();
    first.start().await;
    let outcome = must(first.award_on_success("N5_Quiz:success", success(30))).await;
    assert!(outcome.first_time);
    drop(first);

    let second = open();
    let report = second.start().await;
    assert_eq!(report.remaining, 0);
    let outcome = must(second.award_on_success("N5_Quiz:success", success(30))).await;
    assert!(!outcome.first_time);

    let record = must_some(must(second.record("N5_Quiz:success")), "cached record");
    assert_eq!(record.hit_count, 2);
    assert_eq!(record.xp_total, 30);
    assert_eq!(second.progress().record_count, 1);
}
