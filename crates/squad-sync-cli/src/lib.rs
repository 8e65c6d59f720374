//! `sq`: operator surface over a squad-sync `SQLite` store.
//!
//! Every mutation runs through a [`ScopeManager`]: the scope is fetched and
//! subscribed, the intent is applied optimistically and settled against the
//! store, and the resulting feed echoes are reconciled before the JSON report
//! is printed. Logs go to stderr, filtered by `SQ_LOG` (default `warn`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use squad_sync_core::aggregate::{
    comment_thread, is_voting_closed, percentages, ranked_tallies, reactors, unvoted_options,
    voters_by_option, winner,
};
use squad_sync_core::{
    now_utc, parse_rfc3339_utc, ActorId, EngineConfig, EntityKind, LoadState, OptionId, RecordId,
    ScopeEngine, ScopeId, ScopeKey, ScopeManager,
};
use squad_sync_store_sqlite::SqliteSquadStore;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

type Manager = ScopeManager<SqliteSquadStore, Option<ActorId>>;

#[derive(Debug, Parser)]
#[command(name = "sq")]
#[command(about = "Squad reactions, comments and votes")]
pub struct Cli {
    #[arg(long, default_value = "./squad_sync.sqlite3")]
    db: PathBuf,

    /// Acting user; required for mutations.
    #[arg(long, env = "SQ_ACTOR")]
    actor: Option<String>,

    /// Engine config JSON to validate, persist and use.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Reactions {
        #[command(subcommand)]
        command: ReactionsCommand,
    },
    Comments {
        #[command(subcommand)]
        command: CommentsCommand,
    },
    Votes {
        #[command(subcommand)]
        command: VotesCommand,
    },
    Feed {
        #[command(subcommand)]
        command: FeedCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ReactionsCommand {
    /// Adds the reaction, or removes it when already held.
    Toggle(ReactionArgs),
    List(PhotoArgs),
    Reactors(ReactionArgs),
}

#[derive(Debug, Subcommand)]
pub enum CommentsCommand {
    Post(CommentPostArgs),
    Delete(CommentDeleteArgs),
    List(PhotoArgs),
}

#[derive(Debug, Subcommand)]
pub enum VotesCommand {
    OptionAdd(OptionAddArgs),
    Cast(VoteCastArgs),
    Tally(VoteTallyArgs),
}

#[derive(Debug, Subcommand)]
pub enum FeedCommand {
    Tail(FeedTailArgs),
}

#[derive(Debug, Args)]
pub struct PhotoArgs {
    #[arg(long)]
    photo: String,
}

#[derive(Debug, Args)]
pub struct ReactionArgs {
    #[arg(long)]
    photo: String,
    #[arg(long)]
    emoji: String,
}

#[derive(Debug, Args)]
pub struct CommentPostArgs {
    #[arg(long)]
    photo: String,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Args)]
pub struct CommentDeleteArgs {
    #[arg(long)]
    photo: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct OptionAddArgs {
    #[arg(long)]
    event: String,
    #[arg(long)]
    label: String,
}

#[derive(Debug, Args)]
pub struct VoteCastArgs {
    #[arg(long)]
    event: String,
    #[arg(long)]
    option: String,
}

#[derive(Debug, Args)]
pub struct VoteTallyArgs {
    #[arg(long)]
    event: String,
    /// Voting deadline (RFC3339, UTC).
    #[arg(long)]
    closes_at: Option<String>,
    /// Evaluation time for the deadline; defaults to now.
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct FeedTailArgs {
    #[arg(long, default_value_t = 0)]
    after: i64,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

/// Installs the stderr log subscriber. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("SQ_LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a parsed CLI invocation and prints its JSON result.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, the config
/// is invalid, or the command is rejected.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteSquadStore::open(&cli.db)?;
    store.migrate()?;
    match &cli.config {
        Some(path) => store.set_config(read_config(path)?)?,
        None => {
            store.load_config()?;
        }
    }

    let actor = cli
        .actor
        .as_deref()
        .map(ActorId::new)
        .transpose()
        .context("invalid --actor")?;

    tracing::debug!(db = %cli.db.display(), actor = ?actor, "store ready");
    let output = run_command(cli.command, store, actor)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes a command against an opened store and returns the JSON payload.
///
/// # Errors
/// Returns an error when identifiers fail to parse, the scope cannot be
/// activated, or the engine rejects the intent.
pub fn run_command(
    command: Command,
    store: SqliteSquadStore,
    actor: Option<ActorId>,
) -> Result<Value> {
    match command {
        Command::Reactions { command } => run_reactions(command, store, actor),
        Command::Comments { command } => run_comments(command, store, actor),
        Command::Votes { command } => run_votes(command, store, actor),
        Command::Feed {
            command: FeedCommand::Tail(args),
        } => {
            let entries = store.feed_since(args.after, args.limit)?;
            Ok(serde_json::to_value(entries)?)
        }
    }
}

fn run_reactions(
    command: ReactionsCommand,
    store: SqliteSquadStore,
    actor: Option<ActorId>,
) -> Result<Value> {
    match command {
        ReactionsCommand::Toggle(args) => {
            let (mut manager, load) = open_scope(store, actor, EntityKind::Reaction, &args.photo)?;
            let report = manager.toggle_reaction(&args.emoji)?;
            let reconciled = manager.pump()?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "report": report,
                "reconciled": reconciled,
                "groups": engine.reaction_groups(),
            }))
        }
        ReactionsCommand::List(args) => {
            let (manager, load) = open_scope(store, actor, EntityKind::Reaction, &args.photo)?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "total": engine.records().len(),
                "groups": engine.reaction_groups(),
            }))
        }
        ReactionsCommand::Reactors(args) => {
            let (manager, load) = open_scope(store, actor, EntityKind::Reaction, &args.photo)?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "emoji": args.emoji,
                "actors": reactors(engine.records(), &args.emoji),
            }))
        }
    }
}

fn run_comments(
    command: CommentsCommand,
    store: SqliteSquadStore,
    actor: Option<ActorId>,
) -> Result<Value> {
    match command {
        CommentsCommand::Post(args) => {
            let (mut manager, load) = open_scope(store, actor, EntityKind::Comment, &args.photo)?;
            let report = manager.post_comment(&args.text)?;
            let reconciled = manager.pump()?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "report": report,
                "reconciled": reconciled,
                "thread": comment_thread(engine.records()),
            }))
        }
        CommentsCommand::Delete(args) => {
            let id = RecordId::parse(&args.id)?;
            let (mut manager, load) = open_scope(store, actor, EntityKind::Comment, &args.photo)?;
            let report = manager.delete_record(id)?;
            let reconciled = manager.pump()?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "report": report,
                "reconciled": reconciled,
                "thread": comment_thread(engine.records()),
            }))
        }
        CommentsCommand::List(args) => {
            let (manager, load) = open_scope(store, actor, EntityKind::Comment, &args.photo)?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "thread": comment_thread(engine.records()),
            }))
        }
    }
}

fn run_votes(
    command: VotesCommand,
    mut store: SqliteSquadStore,
    actor: Option<ActorId>,
) -> Result<Value> {
    match command {
        VotesCommand::OptionAdd(args) => {
            let event = ScopeId::new(args.event)?;
            let option = store.add_option(&event, &args.label)?;
            Ok(serde_json::to_value(option)?)
        }
        VotesCommand::Cast(args) => {
            let option = OptionId::parse(&args.option)?;
            let (mut manager, load) = open_scope(store, actor, EntityKind::Vote, &args.event)?;
            let report = manager.cast_vote(option)?;
            let reconciled = manager.pump()?;
            let engine = active_engine(&manager)?;
            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "report": report,
                "reconciled": reconciled,
                "tallies": engine.tallies(),
            }))
        }
        VotesCommand::Tally(args) => {
            let closes_at = args.closes_at.as_deref().map(parse_rfc3339_utc).transpose()?;
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_rfc3339_utc(raw)?,
                None => now_utc(),
            };
            let (manager, load) = open_scope(store, actor, EntityKind::Vote, &args.event)?;
            let engine = active_engine(&manager)?;
            let options = engine.tallies();
            let total_votes: u64 = options
                .iter()
                .map(|option| u64::from(option.vote_count))
                .sum();
            let voters: BTreeMap<String, Vec<ActorId>> = voters_by_option(engine.records())
                .into_iter()
                .map(|(option, actors)| (option.to_string(), actors))
                .collect();
            let unvoted = engine
                .actor()
                .map(|actor| unvoted_options(options, engine.records(), actor));

            Ok(json!({
                "scope": engine.scope().to_string(),
                "load": load,
                "total_votes": total_votes,
                "options": percentages(options),
                "winner": winner(options),
                "ranked": ranked_tallies(options),
                "closed": is_voting_closed(closes_at, as_of),
                "unvoted": unvoted,
                "voters": voters,
            }))
        }
    }
}

fn open_scope(
    store: SqliteSquadStore,
    actor: Option<ActorId>,
    kind: EntityKind,
    scope_id: &str,
) -> Result<(Manager, LoadState)> {
    let scope = ScopeKey::new(kind, ScopeId::new(scope_id)?);
    let config = store.config().clone();
    let mut manager = ScopeManager::new(store, actor, config);
    let load = manager
        .activate(scope.clone())
        .with_context(|| format!("failed to activate scope {scope}"))?;
    Ok((manager, load))
}

fn active_engine(manager: &Manager) -> Result<&ScopeEngine> {
    manager.engine().ok_or_else(|| anyhow!("no scope is active"))
}

fn read_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(EngineConfig::from_json(&value)?)
}
