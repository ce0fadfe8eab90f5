use std::sync::Arc;
use tempfile::TempDir;

use super::*;
use crate::config::DumpOptions;
use crate::engine::fake::FakeEngine;
use crate::state::StateStore;
use async_trait::async_trait;
use crate::keeper::testing::{DB, keeper_with, work_files};

fn blocked_root(dir: &TempDir) -> PathBuf {
    let blocker = dir.path().join("unreachable");
    std::fs::write(&blocker, "a file where a directory should be").expect("write blocker");
    blocker
}

#[tokio::test]
async fn test_backup_to_local_store_then_delete() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("local");
    let engine = Arc::new(FakeEngine::with_payload("CREATE TABLE orders (id INT);"));
    let keeper = keeper_with(&dir, &[("local", root.clone(), None)], engine).await;

    let outcome = run(&keeper, DB).await?;
    assert!(outcome.succeeded());
    assert_eq!(outcome.copies.len(), 1);
    assert_eq!(
        outcome.copies[0].file,
        format!("{}/{}.tar.gz", DB, outcome.backup_id)
    );
    assert!(outcome.copies[0].checksum.is_some());

    let listed = list(&keeper, None, None).await?;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].backups_exist());
    assert!(listed[0].last_backup_at.is_some());

    let stored = root.join(&outcome.copies[0].file);
    assert!(stored.is_file());
    assert!(work_files(&keeper).is_empty());

    let deleted = delete(&keeper, &outcome.backup_id).await?;
    assert_eq!(deleted.removed.len(), 1);
    assert!(deleted.failures.is_empty());
    assert!(matches!(
        get(&keeper, &outcome.backup_id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(!stored.exists());
    Ok(())
}

#[tokio::test]
async fn test_every_copy_is_retrievable_after_backup() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::with_payload("payload"));
    let keeper = keeper_with(
        &dir,
        &[
            ("primary", dir.path().join("primary"), None),
            ("secondary", dir.path().join("secondary"), None),
        ],
        engine,
    )
    .await;

    let outcome = run(&keeper, DB).await?;
    let record = get(&keeper, &outcome.backup_id).await?;
    assert_eq!(record.meta.len(), 2);
    assert_eq!(record.meta[0].file, format!("{}/{}-1.tar.gz", DB, outcome.backup_id));
    assert_eq!(record.meta[1].file, format!("{}/{}-2.tar.gz", DB, outcome.backup_id));

    for entry in &record.meta {
        let backend = keeper.storages.get(&entry.storage_name)?;
        let fetched = dir.path().join("fetched").join(&entry.storage_name);
        backend.retrieve(&entry.file, &fetched).await?;
        assert_eq!(
            archive::file_sha256(&fetched)?,
            entry.checksum.clone().expect("checksum recorded")
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_partial_success_records_only_reachable_backend() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::with_payload("payload"));
    let broken = blocked_root(&dir);
    let keeper = keeper_with(
        &dir,
        &[
            ("broken", broken, None),
            ("local", dir.path().join("local"), None),
        ],
        engine,
    )
    .await;

    let outcome = run(&keeper, DB).await?;
    assert!(outcome.succeeded());
    assert_eq!(outcome.storage_failures.len(), 1);
    assert_eq!(outcome.storage_failures[0].0, "broken");

    let record = get(&keeper, &outcome.backup_id).await?;
    assert_eq!(record.last_status, BackupStatus::Success);
    assert_eq!(record.meta.len(), 1);
    assert_eq!(record.meta[0].storage_name, "local");

    let logs = keeper.store.list_logs(Some(DB), None).await?;
    assert!(logs.iter().any(|l| l.meta["storage"] == "broken"));
    Ok(())
}

#[tokio::test]
async fn test_all_backends_failing_marks_failed_and_cleans_up() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::with_payload("payload"));
    let broken = blocked_root(&dir);
    let keeper = keeper_with(&dir, &[("broken", broken, None)], engine).await;

    let outcome = run(&keeper, DB).await?;
    assert!(!outcome.succeeded());

    let record = get(&keeper, &outcome.backup_id).await?;
    assert_eq!(record.last_status, BackupStatus::Failed);
    assert!(record.meta.is_empty());
    assert!(record.last_backup_at.is_none());
    assert!(!record.backups_exist());
    assert!(work_files(&keeper).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_dump_failure_skips_storage() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("local");
    let engine = Arc::new(FakeEngine {
        fail_dump: true,
        ..FakeEngine::default()
    });
    let keeper = keeper_with(&dir, &[("local", root.clone(), None)], engine).await;

    let outcome = run(&keeper, DB).await?;
    assert_eq!(outcome.status, BackupStatus::Failed);
    assert!(outcome.error.as_deref().is_some_and(|e| e.contains("fake dump")));

    let record = get(&keeper, &outcome.backup_id).await?;
    assert_eq!(record.last_status, BackupStatus::Failed);
    assert!(!root.exists());
    assert!(work_files(&keeper).is_empty());

    let logs = keeper.store.list_logs(Some(DB), None).await?;
    assert!(logs.iter().any(|l| l.meta["stage"] == "dump"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_database_fails_before_side_effects() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::with_payload("payload"));
    let keeper = keeper_with(&dir, &[("local", dir.path().join("local"), None)], engine).await;

    assert!(matches!(
        run(&keeper, "billing").await,
        Err(AppError::Config(_))
    ));
    assert!(list(&keeper, None, None).await?.is_empty());
    assert!(keeper.store.list_logs(None, None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_each_run_gets_a_fresh_identity() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::with_payload("payload"));
    let keeper = keeper_with(&dir, &[("local", dir.path().join("local"), None)], engine).await;

    let (first, second) = tokio::join!(run(&keeper, DB), run(&keeper, DB));
    let (first, second) = (first?, second?);
    assert_ne!(first.backup_id, second.backup_id);
    assert!(first.succeeded() && second.succeeded());
    assert_eq!(list(&keeper, Some(DB), None).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_delete_is_best_effort() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::with_payload("payload"));
    let keeper = keeper_with(&dir, &[("local", dir.path().join("local"), None)], engine).await;

    let outcome = run(&keeper, DB).await?;
    let mut meta = outcome.copies.clone();
    meta.push(CopyEntry {
        storage_name: "decommissioned".to_string(),
        file: "orders_db/old.tar.gz".to_string(),
        checksum: None,
    });
    keeper.store.update_backup_meta(&outcome.backup_id, &meta).await?;

    let deleted = delete(&keeper, &outcome.backup_id).await?;
    assert_eq!(deleted.removed.len(), 1);
    assert_eq!(deleted.failures.len(), 1);
    assert_eq!(deleted.failures[0].0.storage_name, "decommissioned");
    assert!(keeper.store.get_backup_by_id(&outcome.backup_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_get_and_delete_unknown_id_not_found() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(FakeEngine::default());
    let keeper = keeper_with(&dir, &[("local", dir.path().join("local"), None)], engine).await;

    assert!(matches!(get(&keeper, "nope").await, Err(AppError::NotFound(_))));
    assert!(matches!(delete(&keeper, "nope").await, Err(AppError::NotFound(_))));
    Ok(())
}

/// Leaves a directory where the dump file should be, so compression fails.
struct DirectoryDumpEngine;

#[async_trait]
impl DatabaseEngine for DirectoryDumpEngine {
    fn kind(&self) -> &'static str {
        "directory"
    }

    async fn dump(&self, output: &Path, _options: &DumpOptions) -> Result<()> {
        tokio::fs::create_dir_all(output).await?;
        Ok(())
    }

    async fn restore_into(&self, _input: &Path) -> Result<()> {
        Ok(())
    }
}

/// Dumps normally but wipes every backup record while doing so.
struct RecordWipingEngine {
    store: StateStore,
}

#[async_trait]
impl DatabaseEngine for RecordWipingEngine {
    fn kind(&self) -> &'static str {
        "wiping"
    }

    async fn dump(&self, output: &Path, _options: &DumpOptions) -> Result<()> {
        for record in self.store.list_backups(None, None).await? {
            self.store.delete_backup(&record.id).await?;
        }
        tokio::fs::write(output, "payload").await?;
        Ok(())
    }

    async fn restore_into(&self, _input: &Path) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_archive_failure_skips_storage() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("local");
    let mut keeper = keeper_with(
        &dir,
        &[("local", root.clone(), None)],
        Arc::new(FakeEngine::default()),
    )
    .await;
    keeper.engines.insert(DB, Arc::new(DirectoryDumpEngine));

    let outcome = run(&keeper, DB).await?;
    assert_eq!(outcome.status, BackupStatus::Failed);
    assert!(outcome.error.as_deref().is_some_and(|e| e.contains("not a file")));

    let record = get(&keeper, &outcome.backup_id).await?;
    assert_eq!(record.last_status, BackupStatus::Failed);
    assert!(record.meta.is_empty());
    assert!(!root.exists());
    assert!(work_files(&keeper).is_empty());

    let logs = keeper.store.list_logs(Some(DB), None).await?;
    assert!(logs.iter().any(|l| l.meta["stage"] == "dump"));
    Ok(())
}

#[tokio::test]
async fn test_vanished_record_removes_stored_copies() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("local");
    let mut keeper = keeper_with(
        &dir,
        &[("local", root.clone(), None)],
        Arc::new(FakeEngine::default()),
    )
    .await;
    let wiping = RecordWipingEngine {
        store: keeper.store.clone(),
    };
    keeper.engines.insert(DB, Arc::new(wiping));

    let outcome = run(&keeper, DB).await?;
    assert!(!outcome.succeeded());
    assert!(outcome.copies.is_empty());
    assert!(outcome.error.as_deref().is_some_and(|e| e.contains("disappeared")));

    assert!(list(&keeper, None, None).await?.is_empty());
    let stored = root.join(format!("{}/{}.tar.gz", DB, outcome.backup_id));
    assert!(!stored.exists());
    assert!(work_files(&keeper).is_empty());

    let logs = keeper.store.list_logs(Some(DB), None).await?;
    assert!(logs.iter().any(|l| l.record.contains("record disappeared")));
    Ok(())
}
