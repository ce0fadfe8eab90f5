//! Restore orchestration: pick a stored copy, fetch and verify it, extract
//! the dump, and hand it to the database engine.


use std::path::PathBuf;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditMeta};
use crate::backup::archive;
use crate::errors::{AppError, Result};
use crate::keeper::{Keeper, WorkDir};
use crate::state::{CopyEntry, LogKind};

/// Restores `backup_id` into the database configured as `db_ident`.
///
/// Returns `Ok(false)` when no copy could be fetched or the restore command
/// failed; both cases are logged and audited. Unknown backups, backups of a
/// different database, and backups without usable copies are `NotFound`.
pub async fn run(keeper: &Keeper, db_ident: &str, backup_id: &str) -> Result<bool> {
    let db = keeper.config.database(db_ident)?;
    let engine = keeper.engines.get(db_ident)?;

    let record = keeper
        .store
        .get_backup_by_id(backup_id)
        .await?
        .filter(|r| r.db_ident == db_ident)
        .ok_or_else(|| {
            AppError::not_found(format!("backup '{}' for database '{}'", backup_id, db_ident))
        })?;
    if !record.backups_exist() {
        return Err(AppError::not_found(format!(
            "backup '{}' has no restorable copies (status: {})",
            backup_id, record.last_status
        )));
    }

    let candidates = order_candidates(&record.meta, &db.storage);
    let work = keeper
        .claim_work_dir(&format!("restore-{}-{}", backup_id, Uuid::new_v4()))
        .await?;
    info!(
        db = db_ident,
        backup_id,
        candidates = candidates.len(),
        work_dir = %work.path().display(),
        "restore started"
    );

    let mut fetched: Option<(PathBuf, &CopyEntry)> = None;
    for (attempt, entry) in candidates.iter().enumerate() {
        match fetch_copy(keeper, entry, &work, attempt).await {
            Ok(dump_path) => {
                fetched = Some((dump_path, *entry));
                break;
            }
            Err(e) => {
                warn!(
                    db = db_ident,
                    backup_id,
                    storage = %entry.storage_name,
                    error = %e,
                    "fetching copy failed, trying next"
                );
                audit::record(
                    &keeper.store,
                    LogKind::Restore,
                    format!("fetching copy from '{}' failed", entry.storage_name),
                    AuditMeta::for_backup(db_ident, backup_id)
                        .with("storage", entry.storage_name.as_str())
                        .with("file", entry.file.as_str())
                        .error(&e),
                )
                .await;
            }
        }
    }

    let Some((dump_path, source)) = fetched else {
        error!(db = db_ident, backup_id, "restore failed: no copy could be fetched");
        audit::record(
            &keeper.store,
            LogKind::Restore,
            "restore failed: no copy could be fetched",
            AuditMeta::for_backup(db_ident, backup_id),
        )
        .await;
        return Ok(false);
    };

    let meta = AuditMeta::for_backup(db_ident, backup_id)
        .with("storage", source.storage_name.as_str())
        .with("engine", engine.kind());
    let restored = match engine.restore_into(&dump_path).await {
        Ok(()) => {
            info!(db = db_ident, backup_id, storage = %source.storage_name, "restore finished");
            audit::record(&keeper.store, LogKind::Restore, "restore succeeded", meta).await;
            true
        }
        Err(e) => {
            error!(db = db_ident, backup_id, error = %e, "restore command failed");
            audit::record(
                &keeper.store,
                LogKind::Restore,
                "restore command failed",
                meta.error(&e),
            )
            .await;
            false
        }
    };

    drop(work);
    Ok(restored)
}

/// Copies on backends listed in the database's storage order come first, in
/// that order; any remaining copies follow in recorded order.
fn order_candidates<'a>(meta: &'a [CopyEntry], preference: &[String]) -> Vec<&'a CopyEntry> {
    let mut ordered: Vec<&CopyEntry> = preference
        .iter()
        .flat_map(|name| meta.iter().filter(move |e| &e.storage_name == name))
        .collect();
    for entry in meta {
        if !preference.contains(&entry.storage_name) {
            ordered.push(entry);
        }
    }
    ordered
}

/// Retrieves one copy, verifies its checksum and extracts the dump.
async fn fetch_copy(
    keeper: &Keeper,
    entry: &CopyEntry,
    work: &WorkDir,
    attempt: usize,
) -> Result<PathBuf> {
    let backend = keeper.storages.get(&entry.storage_name)?;
    let archive_path = work.join(format!("copy-{}.tar.gz", attempt));
    backend.retrieve(&entry.file, &archive_path).await?;

    let extract_dir = work.join(format!("extract-{}", attempt));
    let expected = entry.checksum.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        if let Some(expected) = expected {
            let actual = archive::file_sha256(&archive_path)?;
            if actual != expected {
                anyhow::bail!("checksum mismatch: expected {}, got {}", expected, actual);
            }
        }
        archive::extract_file(&archive_path, &extract_dir)
    })
    .await?;

    extracted.map_err(|e| AppError::Archive(format!("{:#}", e)))
}
