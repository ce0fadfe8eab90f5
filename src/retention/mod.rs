//! Age-based pruning of stored archives, followed by reconciliation of the
//! backup records that pointed at them.

use tracing::{info, warn};

use crate::audit::{self, AuditMeta};
use crate::errors::Result;
use crate::keeper::Keeper;
use crate::state::{BackupStatus, CopyEntry, LogKind};

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    /// `(storage, files removed)` for every backend swept successfully.
    pub swept: Vec<(String, usize)>,
    /// `(storage, error)` for every backend whose sweep failed.
    pub failures: Vec<(String, String)>,
    /// Copy entries dropped because their artifact is gone.
    pub pruned_copies: usize,
    /// Backup records deleted because no copy was left.
    pub deleted_records: usize,
}

impl RetentionReport {
    pub fn removed_files(&self) -> usize {
        self.swept.iter().map(|(_, n)| n).sum()
    }
}

/// Sweeps every backend that has `retention_days`, then reconciles metadata.
pub async fn run(keeper: &Keeper) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();

    for (backend, days) in keeper.storages.with_retention() {
        let storage = backend.name().to_string();
        match backend.sweep_older_than(days).await {
            Ok(removed) => {
                audit::record(
                    &keeper.store,
                    LogKind::Retention,
                    format!("retention sweep of '{}' removed {} file(s)", storage, removed),
                    AuditMeta::new()
                        .with("storage", storage.as_str())
                        .with("retentionDays", days)
                        .with("removed", removed),
                )
                .await;
                report.swept.push((storage, removed));
            }
            Err(e) => {
                warn!(storage = %storage, error = %e, "retention sweep failed");
                audit::record(
                    &keeper.store,
                    LogKind::Retention,
                    format!("retention sweep of '{}' failed", storage),
                    AuditMeta::new()
                        .with("storage", storage.as_str())
                        .with("retentionDays", days)
                        .error(&e),
                )
                .await;
                report.failures.push((storage, e.to_string()));
            }
        }
    }

    let (pruned_copies, deleted_records) = reconcile(keeper).await?;
    report.pruned_copies = pruned_copies;
    report.deleted_records = deleted_records;

    info!(
        removed = report.removed_files(),
        failed = report.failures.len(),
        pruned_copies,
        deleted_records,
        "retention run finished"
    );
    Ok(report)
}

/// Drops copy entries of successful backups whose artifact no longer exists,
/// and deletes records left with none. Copies on unknown or unreachable
/// backends are kept. Returns `(pruned copies, deleted records)`.
pub async fn reconcile(keeper: &Keeper) -> Result<(usize, usize)> {
    let mut pruned = 0;
    let mut deleted = 0;

    for record in keeper.store.list_backups(None, None).await? {
        if record.last_status != BackupStatus::Success {
            continue;
        }

        let mut kept: Vec<CopyEntry> = Vec::with_capacity(record.meta.len());
        let mut gone: Vec<CopyEntry> = Vec::new();
        for entry in &record.meta {
            if copy_is_gone(keeper, entry).await {
                gone.push(entry.clone());
            } else {
                kept.push(entry.clone());
            }
        }
        if gone.is_empty() {
            continue;
        }
        pruned += gone.len();

        let files: Vec<String> = gone.iter().map(|e| format!("{}:{}", e.storage_name, e.file)).collect();
        let meta = AuditMeta::for_backup(&record.db_ident, &record.id).with("prunedCopies", files);
        if kept.is_empty() {
            keeper.store.delete_backup(&record.id).await?;
            deleted += 1;
            info!(db = %record.db_ident, backup_id = %record.id, "backup record removed: every copy expired");
            audit::record(
                &keeper.store,
                LogKind::Retention,
                "backup record removed: every copy expired",
                meta,
            )
            .await;
        } else {
            keeper.store.update_backup_meta(&record.id, &kept).await?;
            info!(db = %record.db_ident, backup_id = %record.id, pruned = gone.len(), "expired copies pruned from backup record");
            audit::record(
                &keeper.store,
                LogKind::Retention,
                "expired copies pruned from backup record",
                meta,
            )
            .await;
        }
    }

    Ok((pruned, deleted))
}

async fn copy_is_gone(keeper: &Keeper, entry: &CopyEntry) -> bool {
    let Ok(backend) = keeper.storages.get(&entry.storage_name) else {
        warn!(storage = %entry.storage_name, "copy references an unconfigured backend, keeping it");
        return false;
    };
    match backend.exists(&entry.file).await {
        Ok(exists) => !exists,
        Err(e) => {
            warn!(storage = %entry.storage_name, file = %entry.file, error = %e, "could not check copy, keeping it");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup;
    use crate::engine::fake::FakeEngine;
    use crate::keeper::testing::{DB, keeper_with};
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn age_file(path: &Path, days: u64) -> std::io::Result<()> {
        let mtime = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60 + 60);
        File::options().write(true).open(path)?.set_modified(mtime)
    }

    #[tokio::test]
    async fn test_sweep_prunes_records_and_is_idempotent() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("local");
        let engine = Arc::new(FakeEngine::with_payload("payload"));
        let keeper = keeper_with(&dir, &[("local", root.clone(), Some(7))], engine).await;

        let old = backup::run(&keeper, DB).await?;
        let fresh = backup::run(&keeper, DB).await?;
        age_file(&root.join(&old.copies[0].file), 10)?;

        let report = run(&keeper).await?;
        assert_eq!(report.swept, vec![("local".to_string(), 1)]);
        assert_eq!(report.pruned_copies, 1);
        assert_eq!(report.deleted_records, 1);
        assert!(keeper.store.get_backup_by_id(&old.backup_id).await?.is_none());
        assert!(keeper.store.get_backup_by_id(&fresh.backup_id).await?.is_some());
        assert!(root.join(&fresh.copies[0].file).exists());

        let again = run(&keeper).await?;
        assert_eq!(again.removed_files(), 0);
        assert_eq!(again.pruned_copies, 0);
        assert_eq!(again.deleted_records, 0);

        let logs = keeper.store.list_logs(None, None).await?;
        assert_eq!(logs.iter().filter(|l| l.meta.get("removed").is_some()).count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_partially_expired_record_keeps_remaining_copy() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let short = dir.path().join("short");
        let long = dir.path().join("long");
        let engine = Arc::new(FakeEngine::with_payload("payload"));
        let keeper = keeper_with(
            &dir,
            &[("short", short.clone(), Some(1)), ("long", long.clone(), None)],
            engine,
        )
        .await;

        let outcome = backup::run(&keeper, DB).await?;
        age_file(&short.join(&outcome.copies[0].file), 3)?;
        age_file(&long.join(&outcome.copies[1].file), 3)?;

        let report = run(&keeper).await?;
        assert_eq!(report.swept, vec![("short".to_string(), 1)]);
        assert_eq!(report.pruned_copies, 1);
        assert_eq!(report.deleted_records, 0);

        let record = backup::get(&keeper, &outcome.backup_id).await?;
        assert_eq!(record.meta.len(), 1);
        assert_eq!(record.meta[0].storage_name, "long");
        assert!(record.backups_exist());
        Ok(())
    }
}
