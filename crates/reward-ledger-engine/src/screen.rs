//! Entry points for screens.
//!
//! Screens either fire-and-forget an entry reward on mount or await a
//! success reward to decide whether to show the "+N XP" modal. An
//! optional achievement id rides along with either call.

use std::future::Future;
use std::sync::Arc;

use reward_ledger_core::{AwardOutcome, LedgerError, RewardKey, RewardKind, XpSchedule};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::RewardLedger;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnterHookOptions {
    pub xp_on_enter: u32,
    pub repeat_xp: u32,
    pub achievement_id: Option<String>,
    pub achievement_sub: Option<String>,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuccessHookOptions {
    pub xp_on_success: u32,
    pub repeat_xp: u32,
    pub achievement_id: Option<String>,
    pub achievement_sub: Option<String>,
    pub meta: Map<String, Value>,
}

/// Schedules the entry reward for a mounted screen and returns immediately.
///
/// Input is validated before anything is spawned. The returned handle may be
/// dropped; it carries no result. Must be called from within a tokio runtime.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for a malformed key or achievement id.
pub fn use_award_on_enter(
    ledger: &Arc<RewardLedger>,
    key: &str,
    options: EnterHookOptions,
) -> Result<JoinHandle<()>, LedgerError> {
    let key = ledger.parse_key(key)?;
    let achievement = parse_achievement(ledger, options.achievement_id.as_deref())?;
    let schedule = XpSchedule {
        first_xp: options.xp_on_enter,
        repeat_xp: options.repeat_xp,
    };

    let ledger = Arc::clone(ledger);
    Ok(tokio::spawn(async move {
        let meta = options.meta;
        ledger
            .award(key, RewardKind::Enter, schedule, meta.clone())
            .await;
        if let Some(achievement) = achievement {
            award_linked_achievement(&ledger, achievement, options.achievement_sub, meta).await;
        }
    }))
}

/// Records a completed task and resolves to the outcome of the success key.
///
/// # Errors
/// Returns [`LedgerError::Validation`] for a malformed key or achievement id.
pub fn award_on_success<'a>(
    ledger: &'a RewardLedger,
    key: &str,
    options: SuccessHookOptions,
) -> Result<impl Future<Output = AwardOutcome> + Send + 'a, LedgerError> {
    let key = ledger.parse_key(key)?;
    let achievement = parse_achievement(ledger, options.achievement_id.as_deref())?;
    let schedule = XpSchedule {
        first_xp: options.xp_on_success,
        repeat_xp: options.repeat_xp,
    };

    Ok(async move {
        let meta = options.meta;
        let outcome = ledger
            .award(key, RewardKind::Success, schedule, meta.clone())
            .await;
        if let Some(achievement) = achievement {
            award_linked_achievement(ledger, achievement, options.achievement_sub, meta).await;
        }
        outcome
    })
}

fn parse_achievement(
    ledger: &RewardLedger,
    achievement_id: Option<&str>,
) -> Result<Option<RewardKey>, LedgerError> {
    achievement_id.map(|raw| ledger.parse_key(raw)).transpose()
}

/// Achievements linked from a screen carry no XP of their own; the screen's
/// entry or success grant pays for the visit.
async fn award_linked_achievement(
    ledger: &RewardLedger,
    achievement: RewardKey,
    sub: Option<String>,
    mut meta: Map<String, Value>,
) -> AwardOutcome {
    if let Some(sub) = sub {
        meta.insert("sub".to_string(), Value::String(sub));
    }
    ledger
        .award(achievement, RewardKind::Achievement, XpSchedule::default(), meta)
        .await
}
