//! Backup orchestration: dump, compress, replicate to every configured
//! backend, and record where the copies live.

pub(crate) mod archive;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditMeta};
use crate::config::DatabaseConfig;
use crate::engine::DatabaseEngine;
use crate::errors::{AppError, Result};
use crate::keeper::{Keeper, WorkDir};
use crate::state::{BackupRecord, BackupStatus, CopyEntry, LogKind};
use crate::storage::{Storage, archive_name};

/// What a single `backup run` produced.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup_id: String,
    pub db_ident: String,
    pub status: BackupStatus,
    pub copies: Vec<CopyEntry>,
    /// `(storage, error)` for every backend that rejected the archive.
    pub storage_failures: Vec<(String, String)>,
    /// Set when the run aborted before any storage write, or when the record
    /// vanished before the outcome could be written.
    pub error: Option<String>,
}

impl BackupOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == BackupStatus::Success
    }
}

/// Result of deleting a backup and its stored copies.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub backup_id: String,
    pub removed: Vec<CopyEntry>,
    pub failures: Vec<(CopyEntry, String)>,
}

/// Runs one backup of `db_ident`. Configuration problems surface as errors
/// before anything is written; dump, archive and storage failures resolve to
/// a `failed` outcome recorded in the state store.
pub async fn run(keeper: &Keeper, db_ident: &str) -> Result<BackupOutcome> {
    let db = keeper.config.database(db_ident)?;
    let engine = keeper.engines.get(db_ident)?;
    let backends = keeper.storages.for_database(db)?;

    let backup_id = Uuid::new_v4().to_string();
    keeper.store.insert_backup(&backup_id, db_ident).await?;
    info!(db = db_ident, backup_id = %backup_id, backends = backends.len(), "backup started");

    let work = match keeper.claim_work_dir(&format!("backup-{}", backup_id)).await {
        Ok(work) => work,
        Err(e) => return abort(keeper, db_ident, &backup_id, "prepare", e).await,
    };

    let (archive_path, checksum) = match produce_archive(engine.as_ref(), db, &work).await {
        Ok(produced) => produced,
        Err(e) => {
            drop(work);
            return abort(keeper, db_ident, &backup_id, "dump", e).await;
        }
    };

    let (copies, storage_failures) =
        replicate(&backends, &archive_path, db_ident, &backup_id, &checksum).await;
    drop(work);

    for (storage, err) in &storage_failures {
        warn!(db = db_ident, backup_id = %backup_id, storage = %storage, error = %err, "storing archive failed");
        audit::record(
            &keeper.store,
            LogKind::Backup,
            format!("storing backup in '{}' failed", storage),
            AuditMeta::for_backup(db_ident, &backup_id)
                .with("storage", storage.as_str())
                .error(err),
        )
        .await;
    }

    let status = if copies.is_empty() {
        BackupStatus::Failed
    } else {
        BackupStatus::Success
    };
    let finished_at: Option<DateTime<Utc>> = (status == BackupStatus::Success).then(Utc::now);
    let recorded = keeper
        .store
        .update_backup(&backup_id, status, &copies, finished_at)
        .await?;
    if !recorded {
        return Ok(record_vanished(keeper, db_ident, backup_id, copies, storage_failures).await);
    }

    let storages: Vec<&str> = copies.iter().map(|c| c.storage_name.as_str()).collect();
    if status == BackupStatus::Success {
        info!(db = db_ident, backup_id = %backup_id, copies = copies.len(), "backup finished");
        audit::record(
            &keeper.store,
            LogKind::Backup,
            "backup succeeded",
            AuditMeta::for_backup(db_ident, &backup_id).with("storages", storages),
        )
        .await;
    } else {
        error!(db = db_ident, backup_id = %backup_id, "backup failed: no backend accepted the archive");
        audit::record(
            &keeper.store,
            LogKind::Backup,
            "backup failed: no backend accepted the archive",
            AuditMeta::for_backup(db_ident, &backup_id),
        )
        .await;
    }

    Ok(BackupOutcome {
        backup_id,
        db_ident: db_ident.to_string(),
        status,
        copies,
        storage_failures,
        error: None,
    })
}

/// Dumps into the working directory and compresses the dump. Returns the
/// archive path and its checksum; the uncompressed dump is removed.
async fn produce_archive(
    engine: &dyn DatabaseEngine,
    db: &DatabaseConfig,
    work: &WorkDir,
) -> Result<(PathBuf, String)> {
    let dump_path = work.join(format!("{}.sql", db.ident));
    engine.dump(&dump_path, &db.options).await?;

    let archive_path = work.join(format!("{}.tar.gz", db.ident));
    let compress_src = dump_path.clone();
    let compress_dst = archive_path.clone();
    let compressed = tokio::task::spawn_blocking(move || {
        archive::compress_file(&compress_src, &compress_dst)?;
        archive::file_sha256(&compress_dst)
    })
    .await?;
    remove_quietly(&dump_path).await;
    let checksum = compressed.map_err(|e| AppError::Archive(format!("{:#}", e)))?;

    Ok((archive_path, checksum))
}

/// Stores the archive in every backend concurrently. Results are merged only
/// after all attempts finish, in backend preference order.
async fn replicate(
    backends: &[Arc<dyn Storage>],
    archive_path: &Path,
    db_ident: &str,
    backup_id: &str,
    checksum: &str,
) -> (Vec<CopyEntry>, Vec<(String, String)>) {
    let backend_count = backends.len();
    let attempts = backends.iter().enumerate().map(|(index, backend)| {
        let file = archive_name(db_ident, backup_id, index + 1, backend_count);
        async move {
            let result = backend.store(archive_path, &file).await;
            (backend.name().to_string(), file, result)
        }
    });

    let mut copies = Vec::new();
    let mut failures = Vec::new();
    for (storage_name, file, result) in join_all(attempts).await {
        match result {
            Ok(()) => copies.push(CopyEntry {
                storage_name,
                file,
                checksum: Some(checksum.to_string()),
            }),
            Err(e) => failures.push((storage_name, e.to_string())),
        }
    }
    (copies, failures)
}

async fn abort(
    keeper: &Keeper,
    db_ident: &str,
    backup_id: &str,
    stage: &str,
    err: AppError,
) -> Result<BackupOutcome> {
    error!(db = db_ident, backup_id = %backup_id, stage, error = %err, "backup aborted");
    if !keeper
        .store
        .update_backup(backup_id, BackupStatus::Failed, &[], None)
        .await?
    {
        warn!(db = db_ident, backup_id = %backup_id, "backup record disappeared before it could be marked failed");
    }
    audit::record(
        &keeper.store,
        LogKind::Backup,
        format!("backup failed during {}", stage),
        AuditMeta::for_backup(db_ident, backup_id)
            .with("stage", stage)
            .error(&err),
    )
    .await;

    Ok(BackupOutcome {
        backup_id: backup_id.to_string(),
        db_ident: db_ident.to_string(),
        status: BackupStatus::Failed,
        copies: Vec::new(),
        storage_failures: Vec::new(),
        error: Some(err.to_string()),
    })
}

/// The pending record was removed while the run was in flight. Nothing can
/// reference the copies just stored, so they are removed again.
async fn record_vanished(
    keeper: &Keeper,
    db_ident: &str,
    backup_id: String,
    copies: Vec<CopyEntry>,
    storage_failures: Vec<(String, String)>,
) -> BackupOutcome {
    error!(db = db_ident, backup_id = %backup_id, copies = copies.len(), "backup record disappeared during the run");
    let (removed, failures) =
        remove_copies(keeper, LogKind::Backup, db_ident, &backup_id, &copies).await;
    audit::record(
        &keeper.store,
        LogKind::Backup,
        "backup failed: record disappeared during the run",
        AuditMeta::for_backup(db_ident, &backup_id)
            .with("removedCopies", removed.len())
            .with("failedCopies", failures.len()),
    )
    .await;

    BackupOutcome {
        error: Some(format!(
            "backup {} of {} failed: its record disappeared during the run",
            backup_id, db_ident
        )),
        backup_id,
        db_ident: db_ident.to_string(),
        status: BackupStatus::Failed,
        copies: Vec::new(),
        storage_failures,
    }
}

/// Deletes each copy from its backend. Failures are logged and audited under
/// `kind` and returned next to the copies that were removed.
async fn remove_copies(
    keeper: &Keeper,
    kind: LogKind,
    db_ident: &str,
    backup_id: &str,
    entries: &[CopyEntry],
) -> (Vec<CopyEntry>, Vec<(CopyEntry, String)>) {
    let mut removed = Vec::new();
    let mut failures = Vec::new();
    for entry in entries {
        let result = match keeper.storages.get(&entry.storage_name) {
            Ok(backend) => backend.delete(&entry.file).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => removed.push(entry.clone()),
            Err(e) => {
                warn!(
                    backup_id,
                    storage = %entry.storage_name,
                    file = %entry.file,
                    error = %e,
                    "deleting stored copy failed"
                );
                audit::record(
                    &keeper.store,
                    kind,
                    format!("deleting copy from '{}' failed", entry.storage_name),
                    AuditMeta::for_backup(db_ident, backup_id)
                        .with("storage", entry.storage_name.as_str())
                        .with("file", entry.file.as_str())
                        .error(&e),
                )
                .await;
                failures.push((entry.clone(), e.to_string()));
            }
        }
    }
    (removed, failures)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove working file");
        }
    }
}

/// Recorded backups, newest first. An empty result is not an error.
pub async fn list(
    keeper: &Keeper,
    db_ident: Option<&str>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<BackupRecord>> {
    keeper.store.list_backups(db_ident, since).await
}

pub async fn get(keeper: &Keeper, backup_id: &str) -> Result<BackupRecord> {
    keeper
        .store
        .get_backup_by_id(backup_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("backup '{}'", backup_id)))
}

/// Deletes every stored copy on a best-effort basis, then the record itself.
/// Backend failures are logged and audited but never keep the record alive.
pub async fn delete(keeper: &Keeper, backup_id: &str) -> Result<DeleteOutcome> {
    let record = get(keeper, backup_id).await?;
    let (removed, failures) =
        remove_copies(keeper, LogKind::Delete, &record.db_ident, backup_id, &record.meta).await;

    keeper.store.delete_backup(backup_id).await?;
    info!(db = %record.db_ident, backup_id, removed = removed.len(), failed = failures.len(), "backup deleted");
    audit::record(
        &keeper.store,
        LogKind::Delete,
        "backup deleted",
        AuditMeta::for_backup(&record.db_ident, backup_id)
            .with("removedCopies", removed.len())
            .with("failedCopies", failures.len()),
    )
    .await;

    Ok(DeleteOutcome {
        backup_id: backup_id.to_string(),
        removed,
        failures,
    })
}
