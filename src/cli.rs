use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::audit;
use crate::backup::{BackupOutcome, DeleteOutcome};
use crate::retention::RetentionReport;
use crate::state::{BackupRecord, LogRecord};

/// Database backup and restore orchestrator
#[derive(Parser, Debug)]
#[command(name = "dbkeeper", version)]
pub struct Cli {
    /// Path to config.json
    #[arg(short, long, env = "DBKEEPER_CONFIG", default_value = "config.json", global = true)]
    pub config: PathBuf,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, inspect and delete backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Restore a recorded backup
    #[command(subcommand)]
    Restore(RestoreCommand),
    /// Inspect the audit log
    #[command(subcommand)]
    Log(LogCommand),
    /// Apply storage retention policies
    #[command(subcommand)]
    Retention(RetentionCommand),
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Back up one configured database now
    Run {
        /// Database identifier from config.json
        db: String,
    },
    /// List recorded backups, newest first
    List {
        #[arg(long)]
        db: Option<String>,
        /// 30m, 12h, 7d, 2w, YYYY-MM-DD or RFC 3339
        #[arg(long)]
        since: Option<String>,
    },
    /// Show one backup and its stored copies
    Get { id: String },
    /// Delete a backup's stored copies and its record
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum RestoreCommand {
    /// Restore a backup into its configured database
    Run { db: String, backup_id: String },
}

#[derive(Subcommand, Debug)]
pub enum LogCommand {
    /// List audit entries, newest first
    List {
        #[arg(long)]
        db: Option<String>,
        /// 30m, 12h, 7d, 2w, YYYY-MM-DD or RFC 3339
        #[arg(long)]
        since: Option<String>,
    },
    /// Show one audit entry
    Get { id: String },
    /// Delete one audit entry
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum RetentionCommand {
    /// Sweep expired archives and prune records that point at them
    Run,
}

fn fmt_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn yes_no(value: bool) -> &'static str {
    if value { "Yes" } else { "No" }
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Database")]
    database: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Backups Available")]
    available: &'static str,
    #[tabled(rename = "Last Backup")]
    last_backup: String,
    #[tabled(rename = "Created At")]
    created_at: String,
    #[tabled(rename = "Updated At")]
    updated_at: String,
}

#[derive(Tabled)]
struct CopyRow {
    #[tabled(rename = "Storage")]
    storage: String,
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "SHA-256")]
    checksum: String,
}

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Record")]
    record: String,
    #[tabled(rename = "Meta")]
    meta: String,
    #[tabled(rename = "Created At")]
    created_at: String,
}

fn render<T: Tabled>(rows: Vec<T>) -> String {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

pub fn backups_table(records: &[BackupRecord]) -> String {
    if records.is_empty() {
        return "No backups found.".to_string();
    }
    render(
        records
            .iter()
            .map(|r| BackupRow {
                id: r.id.clone(),
                database: r.db_ident.clone(),
                status: r.last_status.to_string(),
                available: yes_no(r.backups_exist()),
                last_backup: r.last_backup_at.as_ref().map(fmt_time).unwrap_or_else(|| "-".to_string()),
                created_at: fmt_time(&r.created_at),
                updated_at: fmt_time(&r.updated_at),
            })
            .collect(),
    )
}

pub fn backup_details(record: &BackupRecord) -> String {
    let mut out = backups_table(std::slice::from_ref(record));
    if record.meta.is_empty() {
        out.push_str("\n\nNo stored copies.");
        return out;
    }
    let copies: Vec<CopyRow> = record
        .meta
        .iter()
        .map(|c| CopyRow {
            storage: c.storage_name.clone(),
            file: c.file.clone(),
            checksum: c.checksum.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    out.push_str("\n\n");
    out.push_str(&render(copies));
    out
}

pub fn logs_table(logs: &[LogRecord]) -> String {
    if logs.is_empty() {
        return "No log entries found.".to_string();
    }
    render(
        logs.iter()
            .map(|l| LogRow {
                id: l.id.clone(),
                kind: l.kind.clone(),
                record: l.record.clone(),
                meta: audit::summarize(&l.meta),
                created_at: fmt_time(&l.created_at),
            })
            .collect(),
    )
}

pub fn log_details(log: &LogRecord) -> String {
    let meta = serde_json::to_string_pretty(&log.meta).unwrap_or_else(|_| log.meta.to_string());
    format!(
        "ID:         {}\nType:       {}\nRecord:     {}\nCreated At: {}\nUpdated At: {}\nMeta:\n{}",
        log.id,
        log.kind,
        log.record,
        fmt_time(&log.created_at),
        fmt_time(&log.updated_at),
        meta
    )
}

pub fn backup_summary(outcome: &BackupOutcome) -> String {
    let mut out = format!(
        "Backup {} of {}: {} ({} cop{})",
        outcome.backup_id,
        outcome.db_ident,
        outcome.status,
        outcome.copies.len(),
        if outcome.copies.len() == 1 { "y" } else { "ies" }
    );
    for copy in &outcome.copies {
        out.push_str(&format!("\n  stored  {} -> {}", copy.storage_name, copy.file));
    }
    for (storage, err) in &outcome.storage_failures {
        out.push_str(&format!("\n  failed  {}: {}", storage, err));
    }
    out
}

pub fn delete_summary(outcome: &DeleteOutcome) -> String {
    let mut out = format!(
        "Deleted backup {} ({} cop{} removed)",
        outcome.backup_id,
        outcome.removed.len(),
        if outcome.removed.len() == 1 { "y" } else { "ies" }
    );
    for (copy, err) in &outcome.failures {
        out.push_str(&format!(
            "\n  could not remove {} from {}: {}",
            copy.file, copy.storage_name, err
        ));
    }
    out
}

pub fn retention_summary(report: &RetentionReport) -> String {
    let mut out = format!(
        "Retention removed {} file(s), pruned {} cop{}, deleted {} record(s)",
        report.removed_files(),
        report.pruned_copies,
        if report.pruned_copies == 1 { "y" } else { "ies" },
        report.deleted_records
    );
    for (storage, removed) in &report.swept {
        out.push_str(&format!("\n  {}: {} removed", storage, removed));
    }
    for (storage, err) in &report.failures {
        out.push_str(&format!("\n  {}: sweep failed: {}", storage, err));
    }
    out
}
