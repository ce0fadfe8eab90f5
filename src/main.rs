//! Database Backup/Restore Orchestrator
//!
//! Dumps configured databases, replicates compressed archives to local and
//! S3-compatible storage, and restores them from recorded metadata.

// dbkeeper/src/main.rs
mod audit;
mod backup;
mod cli;
mod config;
mod engine;
mod errors;
mod keeper;
mod restore;
mod retention;
mod state;
mod storage;
mod utils;

use chrono::Utc;
use clap::Parser;
use std::process::ExitCode;

use cli::{BackupCommand, Cli, Commands, LogCommand, RestoreCommand, RetentionCommand};
use config::AppConfig;
use errors::{AppError, Result};
use keeper::Keeper;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from_json(&cli.config)
        .map_err(|e| AppError::config(format!("{:#}", e)))?;
    let keeper = Keeper::open(config).await?;

    match cli.command {
        Commands::Backup(cmd) => run_backup_command(&keeper, cmd).await,
        Commands::Restore(RestoreCommand::Run { db, backup_id }) => {
            if restore::run(&keeper, &db, &backup_id).await? {
                println!("✅ Restored backup {} into {}", backup_id, db);
                Ok(())
            } else {
                Err(AppError::execution(format!(
                    "restore of backup {} into {} failed; see `dbkeeper log list --db {}`",
                    backup_id, db, db
                )))
            }
        }
        Commands::Log(cmd) => run_log_command(&keeper, cmd).await,
        Commands::Retention(RetentionCommand::Run) => {
            let report = retention::run(&keeper).await?;
            println!("{}", cli::retention_summary(&report));
            if report.failures.is_empty() {
                Ok(())
            } else {
                Err(AppError::execution(format!(
                    "retention sweep failed for {} storage backend(s)",
                    report.failures.len()
                )))
            }
        }
    }
}

async fn run_backup_command(keeper: &Keeper, cmd: BackupCommand) -> Result<()> {
    match cmd {
        BackupCommand::Run { db } => {
            let outcome = backup::run(keeper, &db).await?;
            println!("{}", cli::backup_summary(&outcome));
            if outcome.succeeded() {
                println!("✅ Backup completed successfully.");
                Ok(())
            } else {
                Err(AppError::execution(outcome.error.unwrap_or_else(|| {
                    format!("backup {} of {} failed: no storage backend accepted the archive", outcome.backup_id, db)
                })))
            }
        }
        BackupCommand::List { db, since } => {
            let since = since
                .map(|s| utils::parse_since(&s, Utc::now()))
                .transpose()?;
            let records = backup::list(keeper, db.as_deref(), since).await?;
            println!("{}", cli::backups_table(&records));
            Ok(())
        }
        BackupCommand::Get { id } => {
            let record = backup::get(keeper, &id).await?;
            println!("{}", cli::backup_details(&record));
            Ok(())
        }
        BackupCommand::Delete { id } => {
            let outcome = backup::delete(keeper, &id).await?;
            println!("{}", cli::delete_summary(&outcome));
            Ok(())
        }
    }
}

async fn run_log_command(keeper: &Keeper, cmd: LogCommand) -> Result<()> {
    match cmd {
        LogCommand::List { db, since } => {
            let since = since
                .map(|s| utils::parse_since(&s, Utc::now()))
                .transpose()?;
            let logs = keeper.store.list_logs(db.as_deref(), since).await?;
            println!("{}", cli::logs_table(&logs));
            Ok(())
        }
        LogCommand::Get { id } => {
            let log = keeper
                .store
                .get_log_by_id(&id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("log entry '{}'", id)))?;
            println!("{}", cli::log_details(&log));
            Ok(())
        }
        LogCommand::Delete { id } => {
            if keeper.store.delete_log(&id).await? {
                println!("✅ Deleted log entry {}", id);
                Ok(())
            } else {
                Err(AppError::not_found(format!("log entry '{}'", id)))
            }
        }
    }
}

/// Installs the tracing subscriber. `RUST_LOG` wins over `-v`; setting
/// `DBKEEPER_LOG_FILE` sends detailed logs to that file instead of stderr.
fn setup_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Ok(log_file) = std::env::var("DBKEEPER_LOG_FILE") {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
        {
            Ok(file) => {
                fmt()
                    .with_env_filter(env_filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_line_number(true)
                    .init();
                return;
            }
            Err(e) => eprintln!("⚠️ Cannot open log file {}: {}; logging to stderr", log_file, e),
        }
    }

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .compact()
        .init();
}
