//! Command surface over a [`RewardLedger`] backed by two SQLite files: the
//! shared reward store (`--db`) and the per-device outbox (`--outbox`).
//!
//! Every command prints pretty JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use reward_ledger_core::{
    parse_meta_json, AwardOutcome, LedgerConfig, PendingDeltas, RewardKey, RewardRecord, UserId,
};
use reward_ledger_engine::{
    award_on_success, AchievementOptions, EnterOptions, RewardLedger, SqliteOutbox, SqliteRemote,
    SuccessHookOptions,
};
use reward_ledger_store_sqlite::{SqliteDeltaOutbox, SqliteRewardStore};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Reward ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./reward_ledger.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./reward_outbox.sqlite3")]
    outbox: PathBuf,

    #[arg(long)]
    user: String,

    /// JSON file with ledger settings; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Award {
        #[command(subcommand)]
        command: AwardCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    Progress,
    Reconcile,
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum AwardCommand {
    Enter(EnterArgs),
    Success(SuccessArgs),
    Achievement(AchievementArgs),
}

#[derive(Debug, Args)]
pub struct EnterArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    xp: u32,
    #[arg(long, default_value_t = 0)]
    repeat_xp: u32,
    #[arg(long, default_value = "{}")]
    meta: String,
}

#[derive(Debug, Args)]
pub struct SuccessArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    xp: u32,
    #[arg(long, default_value_t = 0)]
    repeat_xp: u32,
    #[arg(long)]
    achievement_id: Option<String>,
    #[arg(long)]
    achievement_sub: Option<String>,
    #[arg(long, default_value = "{}")]
    meta: String,
}

#[derive(Debug, Args)]
pub struct AchievementArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = 0)]
    xp: u32,
    #[arg(long)]
    sub: Option<String>,
    #[arg(long, default_value = "{}")]
    meta: String,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Show {
        #[arg(long)]
        key: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
pub enum OutboxCommand {
    List,
}

#[derive(Debug, Serialize)]
struct AwardReport<'a> {
    key: &'a str,
    #[serde(flatten)]
    outcome: AwardOutcome,
    record: Option<RewardRecord>,
}

#[derive(Debug, Serialize)]
struct PendingEntry {
    key: RewardKey,
    #[serde(flatten)]
    deltas: PendingDeltas,
}

/// Runs a parsed [`Cli`] against its SQLite files.
///
/// # Errors
/// Returns an error for invalid input, unreadable configuration, or when the
/// SQLite files cannot be opened.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let user_id = UserId::parse(&cli.user)?;

    let store = SqliteRewardStore::open(&cli.db)?;
    store.migrate()?;
    let outbox = SqliteDeltaOutbox::open(&cli.outbox)?;
    outbox.migrate()?;

    let ledger = RewardLedger::new(
        user_id,
        Arc::new(SqliteRemote::new(store)),
        Arc::new(SqliteOutbox::new(outbox)),
        config,
    )?;
    debug!(
        db = %cli.db.display(),
        outbox = %cli.outbox.display(),
        user_id = %ledger.user_id(),
        "reward ledger opened"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(run_command(cli.command, &ledger))
}

async fn run_command(command: Command, ledger: &RewardLedger) -> Result<()> {
    let startup = ledger.start().await;

    match command {
        Command::Award { command } => run_award(command, ledger).await,
        Command::Record { command } => match command {
            RecordCommand::Show { key } => {
                let record = ledger
                    .record(&key)?
                    .ok_or_else(|| anyhow!("no reward record for key {key}"))?;
                print_json(&record)
            }
            RecordCommand::List => print_json(&ledger.records()),
        },
        Command::Progress => print_json(&ledger.progress()),
        Command::Reconcile => print_json(&startup),
        Command::Outbox {
            command: OutboxCommand::List,
        } => {
            let pending = ledger
                .pending_deltas()?
                .into_iter()
                .map(|(key, deltas)| PendingEntry { key, deltas })
                .collect::<Vec<_>>();
            print_json(&pending)
        }
    }
}

async fn run_award(command: AwardCommand, ledger: &RewardLedger) -> Result<()> {
    match command {
        AwardCommand::Enter(args) => {
            let options = EnterOptions {
                xp_on_enter: args.xp,
                repeat_xp: args.repeat_xp,
                meta: parse_meta(&args.meta)?,
            };
            let outcome = ledger.award_on_enter(&args.key, options)?.await;
            print_award(ledger, &args.key, outcome)
        }
        AwardCommand::Success(args) => {
            let options = SuccessHookOptions {
                xp_on_success: args.xp,
                repeat_xp: args.repeat_xp,
                achievement_id: args.achievement_id,
                achievement_sub: args.achievement_sub,
                meta: parse_meta(&args.meta)?,
            };
            let outcome = award_on_success(ledger, &args.key, options)?.await;
            print_award(ledger, &args.key, outcome)
        }
        AwardCommand::Achievement(args) => {
            let options = AchievementOptions {
                xp: args.xp,
                sub: args.sub,
                meta: parse_meta(&args.meta)?,
            };
            let outcome = ledger.award_achievement(&args.id, options)?.await;
            print_award(ledger, &args.id, outcome)
        }
    }
}

fn print_award(ledger: &RewardLedger, key: &str, outcome: AwardOutcome) -> Result<()> {
    print_json(&AwardReport {
        key,
        outcome,
        record: ledger.record(key)?,
    })
}

fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    let Some(path) = path else {
        return Ok(LedgerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} must be valid JSON", path.display()))?;
    Ok(LedgerConfig::from_json(&value)?)
}

fn parse_meta(raw: &str) -> Result<Map<String, Value>> {
    Ok(parse_meta_json(raw)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
