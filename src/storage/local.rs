use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Storage;
use crate::errors::{AppError, Result};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Archives kept as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    name: String,
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let is_plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(AppError::storage(
                &self.name,
                format!("invalid object name '{}'", name),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn err(&self, action: &str, path: &Path, e: impl std::fmt::Display) -> AppError {
        AppError::storage(
            &self.name,
            format!("failed to {} {}: {}", action, path.display(), e),
        )
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, local_path: &Path, name: &str) -> Result<()> {
        let target = self.resolve(name)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.err("create directory", parent, e))?;
        }

        // Copy under a temporary name so a reader never sees a half-written archive.
        let partial = target.with_extension("partial");
        tokio::fs::copy(local_path, &partial)
            .await
            .map_err(|e| self.err("write", &partial, e))?;
        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(self.err("finalize", &target, e));
        }

        debug!(storage = %self.name, path = %target.display(), "stored archive");
        Ok(())
    }

    async fn retrieve(&self, name: &str, local_path: &Path) -> Result<()> {
        let source = self.resolve(name)?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.err("create directory", parent, e))?;
        }
        tokio::fs::copy(&source, local_path)
            .await
            .map_err(|e| self.err("read", &source, e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let target = self.resolve(name)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(storage = %self.name, path = %target.display(), "archive already absent");
                Ok(())
            }
            Err(e) => Err(self.err("delete", &target, e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let target = self.resolve(name)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| self.err("inspect", &target, e))
    }

    async fn sweep_older_than(&self, days: u64) -> Result<usize> {
        let root = self.root.clone();
        let storage = self.name.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_dir(&storage, &root, days)).await?;
        let removed = removed?;
        info!(storage = %self.name, days, removed, "local retention sweep finished");
        Ok(removed)
    }
}

fn sweep_dir(storage: &str, root: &Path, days: u64) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let threshold = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| AppError::storage(storage, format!("failed to walk {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| AppError::storage(storage, e))?
            .modified()?;
        let Ok(age) = now.duration_since(modified) else {
            // Modified in the future; never older than the threshold.
            continue;
        };
        if whole_days(age) > whole_days(threshold) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(storage, path = %entry.path().display(), error = %e, "failed to remove expired archive"),
            }
        }
    }
    Ok(removed)
}

fn whole_days(age: Duration) -> u64 {
    age.as_secs() / SECS_PER_DAY
}
