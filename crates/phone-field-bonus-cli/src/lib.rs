//! Operator command surface for the phone field bonus.
//!
//! Every command opens the shared `SQLite` database named by `--db`, applies
//! the schema, and prints a JSON document on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use phone_field_bonus_core::{
    register_triggers, Admin, AwardGuard, AwardJob, Awarder, BonusDispatcher, EventRegistry,
    JobQueue, JobWorker, RetryPolicy, SettingsProvider, SystemClock, TriggerEvent, TriggerKind,
    UserFieldStore, UserId,
};
use phone_field_bonus_store_sqlite::{probe_scoring_backend, SqliteBonusStore};
use serde::Serialize;
use time::Date;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "pfb")]
#[command(about = "Phone field bonus operator CLI")]
pub struct Cli {
    #[arg(long, default_value = "./phone_field_bonus.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deliver one host trigger to the bonus handlers.
    Trigger(TriggerArgs),
    Recheck {
        #[command(subcommand)]
        command: RecheckCommand,
    },
    Diagnose(UserArgs),
    RateLimit {
        #[command(subcommand)]
        command: RateLimitCommand,
    },
    Health,
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Debug, Args)]
pub struct TriggerArgs {
    #[arg(long)]
    kind: TriggerKindArg,
    #[arg(long)]
    user_id: Option<u64>,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user_id: u64,
}

#[derive(Debug, Subcommand)]
pub enum RecheckCommand {
    User(UserArgs),
    All {
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 0)]
        batch_delay_ms: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum RateLimitCommand {
    Status(UserArgs),
    /// Clear one user's counter, or every counter without `--user-id`.
    Clear {
        #[arg(long)]
        user_id: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    Show {
        /// Last day of the report, `YYYY-MM-DD`. Defaults to today (UTC).
        #[arg(long)]
        date: Option<String>,
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
    Cleanup {
        /// Defaults to the configured retention.
        #[arg(long)]
        days_to_keep: Option<u32>,
    },
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    Run {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    List,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Purge,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    Set {
        #[arg(long)]
        name: String,
        #[arg(long)]
        value: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    SetField {
        #[arg(long)]
        user_id: u64,
        #[arg(long)]
        field_id: String,
        #[arg(long)]
        value: String,
    },
    Show(UserArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TriggerKindArg {
    UserUpdated,
    UserCustomFieldsUpdated,
    UserProfileUpdated,
    UserFieldUpdated,
}

impl From<TriggerKindArg> for TriggerKind {
    fn from(value: TriggerKindArg) -> Self {
        match value {
            TriggerKindArg::UserUpdated => Self::UserUpdated,
            TriggerKindArg::UserCustomFieldsUpdated => Self::UserCustomFieldsUpdated,
            TriggerKindArg::UserProfileUpdated => Self::UserProfileUpdated,
            TriggerKindArg::UserFieldUpdated => Self::UserFieldUpdated,
        }
    }
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = Arc::new(SqliteBonusStore::open(&cli.db)?);
    store.migrate()?;
    debug!(db = %cli.db.display(), "opened phone field bonus database");
    run_command(cli.command, &store)
}

/// Executes one command against an already migrated store.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_command(command: Command, store: &Arc<SqliteBonusStore>) -> Result<()> {
    match command {
        Command::Trigger(args) => {
            let guard = build_guard(store)?;
            let dispatcher = BonusDispatcher::new(guard).with_queue(store.clone());
            let mut registry = EventRegistry::new();
            register_triggers(&mut registry, Arc::new(dispatcher));

            let event = TriggerEvent {
                kind: args.kind.into(),
                user_id: args.user_id.map(UserId),
            };
            print_json(&registry.publish(&event))
        }
        Command::Recheck { command } => {
            let admin = Admin::new(build_guard(store)?);
            match command {
                RecheckCommand::User(args) => {
                    print_json(&admin.recheck_user(parse_user_id(args.user_id)?)?)
                }
                RecheckCommand::All {
                    batch_size,
                    batch_delay_ms,
                } => print_json(
                    &admin.recheck_all(batch_size, Duration::from_millis(batch_delay_ms))?,
                ),
            }
        }
        Command::Diagnose(args) => {
            let admin = Admin::new(build_guard(store)?);
            print_json(&admin.diagnose_user(parse_user_id(args.user_id)?)?)
        }
        Command::RateLimit { command } => {
            let admin = Admin::new(build_guard(store)?);
            match command {
                RateLimitCommand::Status(args) => {
                    print_json(&admin.rate_limit_status(parse_user_id(args.user_id)?)?)
                }
                RateLimitCommand::Clear { user_id } => {
                    let user_id = user_id.map(parse_user_id).transpose()?;
                    let cleared = admin.clear_rate_limits(user_id)?;
                    print_json(&serde_json::json!({ "cleared": cleared }))
                }
            }
        }
        Command::Health => print_json(&Admin::new(build_guard(store)?).health()?),
        Command::Stats { command } => {
            let guard = build_guard(store)?;
            let stats = guard.stats();
            match command {
                StatsCommand::Show { date, days } => {
                    let end = match date {
                        Some(raw) => parse_date(&raw)?,
                        None => stats.today(),
                    };
                    let start = range_start(end, days)?;
                    print_json(&stats.for_range(start, end)?)
                }
                StatsCommand::Cleanup { days_to_keep } => {
                    let days_to_keep = match days_to_keep {
                        Some(days) => days,
                        None => guard.load_settings()?.stats_retention_days,
                    };
                    let deleted = stats.cleanup_old_stats(days_to_keep)?;
                    print_json(&serde_json::json!({ "deleted": deleted }))
                }
            }
        }
        Command::Jobs { command } => match command {
            JobsCommand::Run { limit } => {
                let guard = build_guard(store)?;
                let worker = JobWorker::new(
                    AwardJob::new(guard),
                    store.clone(),
                    RetryPolicy::default(),
                    Arc::new(SystemClock),
                );
                print_json(&worker.run_due(limit)?)
            }
            JobsCommand::List => print_json(&store.jobs()?),
        },
        Command::Cache { command } => match command {
            CacheCommand::Purge => {
                let purged = store.purge_expired()?;
                print_json(&serde_json::json!({ "purged": purged }))
            }
        },
        Command::Settings { command } => {
            if let SettingsCommand::Set { name, value } = command {
                store.set_setting(&name, &value)?;
            }
            print_json(&serde_json::json!({
                "effective": store.bonus_settings()?,
                "stored": store.settings_entries()?,
            }))
        }
        Command::User { command } => match command {
            UserCommand::SetField {
                user_id,
                field_id,
                value,
            } => {
                let user_id = parse_user_id(user_id)?;
                store.set_user_field(user_id, &field_id, &value)?;
                print_json(&store.find_user(user_id)?)
            }
            UserCommand::Show(args) => {
                let user_id = parse_user_id(args.user_id)?;
                let user = store
                    .find_user(user_id)?
                    .with_context(|| format!("user {user_id} not found"))?;
                print_json(&user)
            }
        },
    }
}

fn build_guard(store: &Arc<SqliteBonusStore>) -> Result<Arc<AwardGuard>> {
    let settings = store.bonus_settings()?;
    let backend = probe_scoring_backend(store, settings.allow_fallback_counter)?;
    Ok(Arc::new(AwardGuard::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Awarder::new(backend),
        Arc::new(SystemClock),
    )))
}

fn parse_user_id(value: u64) -> Result<UserId> {
    Ok(UserId::parse(&value.to_string())?)
}

fn parse_date(raw: &str) -> Result<Date> {
    let format = time::format_description::parse("[year]-[month]-[day]")
        .map_err(|err| anyhow!("invalid date format description: {err}"))?;
    Date::parse(raw, &format).map_err(|err| anyhow!("invalid date {raw:?}, expected YYYY-MM-DD: {err}"))
}

/// First day of a `days`-long report ending on `end`.
fn range_start(end: Date, days: u32) -> Result<Date> {
    if days == 0 {
        return Err(anyhow!("--days MUST be >= 1"));
    }
    end.checked_sub(time::Duration::days(i64::from(days - 1)))
        .ok_or_else(|| anyhow!("--days {days} reaches before {}", Date::MIN))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_kind_args_map_onto_every_trigger() {
        let mapped = [
            TriggerKindArg::UserUpdated,
            TriggerKindArg::UserCustomFieldsUpdated,
            TriggerKindArg::UserProfileUpdated,
            TriggerKindArg::UserFieldUpdated,
        ]
        .map(TriggerKind::from);
        assert_eq!(mapped, TriggerKind::ALL);
    }

    #[test]
    fn dates_parse_as_calendar_days() {
        let parsed = match parse_date("2026-10-19") {
            Ok(value) => value,
            Err(err) => panic!("expected date to parse: {err:#}"),
        };
        assert_eq!(parsed.to_string(), "2026-10-19");
        assert!(parse_date("19/10/2026").is_err());
    }

    #[test]
    fn report_ranges_stay_on_the_calendar() {
        let end = match parse_date("2026-10-19") {
            Ok(value) => value,
            Err(err) => panic!("expected date to parse: {err:#}"),
        };
        match range_start(end, 7) {
            Ok(start) => assert_eq!(start.to_string(), "2026-10-13"),
            Err(err) => panic!("expected a week long range: {err:#}"),
        }
        assert!(range_start(end, 0).is_err());
        assert!(range_start(end, u32::MAX).is_err());
    }

    #[test]
    fn zero_user_ids_are_rejected() {
        assert!(parse_user_id(0).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
