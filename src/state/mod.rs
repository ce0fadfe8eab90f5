//! Durable backup and audit-log records kept in an embedded SQLite file.

pub mod models;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::errors::Result;
pub use models::{BackupRecord, BackupStatus, CopyEntry, LogKind, LogRecord};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS backup (
        id TEXT PRIMARY KEY NOT NULL,
        dbIdent TEXT NOT NULL,
        meta TEXT NOT NULL DEFAULT '[]',
        lastStatus TEXT NOT NULL,
        lastBackupAt TEXT,
        createdAt TEXT NOT NULL,
        updatedAt TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_backup_db_created ON backup (dbIdent, createdAt)",
    "CREATE TABLE IF NOT EXISTS log (
        id TEXT PRIMARY KEY NOT NULL,
        record TEXT NOT NULL,
        type TEXT NOT NULL,
        meta TEXT NOT NULL DEFAULT '{}',
        createdAt TEXT NOT NULL,
        updatedAt TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_log_created ON log (createdAt)",
];

#[derive(Debug, FromRow)]
#[sqlx(rename_all = "camelCase")]
struct BackupRow {
    id: String,
    db_ident: String,
    meta: String,
    last_status: String,
    last_backup_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = crate::errors::AppError;

    fn try_from(row: BackupRow) -> Result<Self> {
        Ok(BackupRecord {
            meta: serde_json::from_str(&row.meta)?,
            last_status: row.last_status.parse()?,
            id: row.id,
            db_ident: row.db_ident,
            last_backup_at: row.last_backup_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
#[sqlx(rename_all = "camelCase")]
struct LogRow {
    id: String,
    record: String,
    #[sqlx(rename = "type")]
    kind: String,
    meta: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for LogRecord {
    type Error = crate::errors::AppError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(LogRecord {
            meta: serde_json::from_str(&row.meta)?,
            id: row.id,
            record: row.record,
            kind: row.kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// SQLite-backed store for `backup` and `log` records.
///
/// Every mutating call is a single statement and commits on its own; SQLite
/// serializes the writers, so a record is never observed mid-update.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: Pool<Sqlite>,
}

impl StateStore {
    /// Opens (creating if missing) the state file. Call [`StateStore::migrate`] before use.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        debug!(path = %path.display(), "connected to state database");
        Ok(Self { pool })
    }

    /// Creates the tables if they do not exist. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_backup(&self, id: &str, db_ident: &str) -> Result<BackupRecord> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO backup (id, dbIdent, meta, lastStatus, lastBackupAt, createdAt, updatedAt)
             VALUES (?, ?, '[]', ?, NULL, ?, ?)",
        )
        .bind(id)
        .bind(db_ident)
        .bind(BackupStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(BackupRecord {
            id: id.to_string(),
            db_ident: db_ident.to_string(),
            meta: Vec::new(),
            last_status: BackupStatus::Pending,
            last_backup_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Writes the terminal state of a run. Returns false when no row matched.
    pub async fn update_backup(
        &self,
        id: &str,
        status: BackupStatus,
        meta: &[CopyEntry],
        last_backup_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup
             SET lastStatus = ?, meta = ?, lastBackupAt = COALESCE(?, lastBackupAt), updatedAt = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(meta)?)
        .bind(last_backup_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_backup_meta(&self, id: &str, meta: &[CopyEntry]) -> Result<bool> {
        let result = sqlx::query("UPDATE backup SET meta = ?, updatedAt = ? WHERE id = ?")
            .bind(serde_json::to_string(meta)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_backup_by_id(&self, id: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query_as::<_, BackupRow>("SELECT * FROM backup WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BackupRecord::try_from).transpose()
    }

    /// Newest first. Both filters are optional.
    pub async fn list_backups(
        &self,
        db_ident: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query_as::<_, BackupRow>(
            "SELECT * FROM backup
             WHERE (?1 IS NULL OR dbIdent = ?1) AND (?2 IS NULL OR createdAt >= ?2)
             ORDER BY createdAt DESC, rowid DESC",
        )
        .bind(db_ident)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    pub async fn delete_backup(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_log(
        &self,
        kind: LogKind,
        record: &str,
        meta: serde_json::Value,
    ) -> Result<LogRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO log (id, record, type, meta, createdAt, updatedAt) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record)
        .bind(kind.as_str())
        .bind(meta.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(LogRecord {
            id,
            record: record.to_string(),
            kind: kind.as_str().to_string(),
            meta,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_log_by_id(&self, id: &str) -> Result<Option<LogRecord>> {
        let row = sqlx::query_as::<_, LogRow>("SELECT * FROM log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LogRecord::try_from).transpose()
    }

    /// Newest first. `db_ident` matches the `dbIdent` key of the log's meta.
    pub async fn list_logs(
        &self,
        db_ident: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT * FROM log
             WHERE (?1 IS NULL OR json_extract(meta, '$.dbIdent') = ?1)
               AND (?2 IS NULL OR createdAt >= ?2)
             ORDER BY createdAt DESC, rowid DESC",
        )
        .bind(db_ident)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LogRecord::try_from).collect()
    }

    pub async fn delete_log(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM log WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) async fn open_store(dir: &TempDir) -> StateStore {
        let store = StateStore::connect(&dir.path().join("state/state.db"))
            .await
            .expect("connect state store");
        store.migrate().await.expect("migrate state store");
        store
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        store.migrate().await?;
        store.migrate().await?;
        assert!(store.list_backups(None, None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_lifecycle() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let created = store.insert_backup("b-1", "orders_db").await?;
        assert_eq!(created.last_status, BackupStatus::Pending);

        let fetched = store.get_backup_by_id("b-1").await?.expect("record exists");
        assert_eq!(fetched.last_status, BackupStatus::Pending);
        assert!(fetched.meta.is_empty());
        assert!(fetched.last_backup_at.is_none());

        let meta = vec![CopyEntry {
            storage_name: "local".to_string(),
            file: "orders_db/b-1.tar.gz".to_string(),
            checksum: Some("abc".to_string()),
        }];
        let finished_at = Utc::now();
        assert!(
            store
                .update_backup("b-1", BackupStatus::Success, &meta, Some(finished_at))
                .await?
        );

        let fetched = store.get_backup_by_id("b-1").await?.expect("record exists");
        assert_eq!(fetched.last_status, BackupStatus::Success);
        assert_eq!(fetched.meta, meta);
        assert_eq!(fetched.last_backup_at, Some(finished_at));
        assert!(fetched.updated_at >= fetched.created_at);
        assert!(fetched.backups_exist());

        assert!(store.delete_backup("b-1").await?);
        assert!(store.get_backup_by_id("b-1").await?.is_none());
        assert!(!store.delete_backup("b-1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_missing_backup_reports_no_row() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        assert!(
            !store
                .update_backup("missing", BackupStatus::Failed, &[], None)
                .await?
        );
        assert!(store.get_backup_by_id("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_last_backup_at() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        store.insert_backup("b-2", "orders_db").await?;
        let at = Utc::now();
        store
            .update_backup("b-2", BackupStatus::Success, &[], Some(at))
            .await?;
        store
            .update_backup("b-2", BackupStatus::Failed, &[], None)
            .await?;
        let fetched = store.get_backup_by_id("b-2").await?.expect("record exists");
        assert_eq!(fetched.last_backup_at, Some(at));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_backups_filters() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;
        store.insert_backup("a", "orders_db").await?;
        store.insert_backup("b", "billing").await?;
        store.insert_backup("c", "orders_db").await?;

        let all = store.list_backups(None, None).await?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "c");

        let orders = store.list_backups(Some("orders_db"), None).await?;
        assert_eq!(
            orders.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "a"]
        );

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(store.list_backups(None, Some(future)).await?.is_empty());

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.list_backups(Some("billing"), Some(past)).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_log_crud_and_filters() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let first = store
            .insert_log(
                LogKind::Backup,
                "backup finished",
                json!({ "dbIdent": "orders_db", "backupId": "a" }),
            )
            .await?;
        store
            .insert_log(LogKind::Retention, "sweep", json!({ "storage": "local" }))
            .await?;

        let fetched = store.get_log_by_id(&first.id).await?.expect("log exists");
        assert_eq!(fetched.kind, "backup");
        assert_eq!(fetched.meta["backupId"], "a");

        assert_eq!(store.list_logs(None, None).await?.len(), 2);
        let orders = store.list_logs(Some("orders_db"), None).await?;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, first.id);
        assert!(store.list_logs(Some("billing"), None).await?.is_empty());

        assert!(store.delete_log(&first.id).await?);
        assert!(store.get_log_by_id(&first.id).await?.is_none());
        Ok(())
    }
}
