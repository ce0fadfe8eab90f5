//! Named storage backends that hold backup archives.

pub(crate) mod local;
pub(crate) mod s3;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::{AppConfig, DatabaseConfig, StorageKind, StorageSettings};
use crate::errors::{AppError, Result};
pub use local::LocalStorage;
pub use s3::S3Storage;

/// Operations every backend honors. `name` is the backend-relative object name
/// recorded in a copy entry.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    async fn store(&self, local_path: &Path, name: &str) -> Result<()>;

    async fn retrieve(&self, name: &str, local_path: &Path) -> Result<()>;

    /// Removing an object that is already gone is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Removes every object older than `days` whole days. Returns the count removed.
    async fn sweep_older_than(&self, days: u64) -> Result<usize>;
}

#[derive(Clone)]
pub struct StorageRegistry {
    backends: HashMap<String, Arc<dyn Storage>>,
    retention: HashMap<String, u64>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            retention: HashMap::new(),
        }
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        for settings in config.storages.values() {
            let backend = build_backend(settings).await;
            registry.insert(backend, settings.retention_days);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, backend: Arc<dyn Storage>, retention_days: Option<u64>) {
        let name = backend.name().to_string();
        match retention_days {
            Some(days) => {
                self.retention.insert(name.clone(), days);
            }
            None => {
                self.retention.remove(&name);
            }
        }
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Storage>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::config(format!("storage backend '{}' is not configured", name)))
    }

    /// Backends configured for a database, in its preference order.
    pub fn for_database(&self, db: &DatabaseConfig) -> Result<Vec<Arc<dyn Storage>>> {
        db.storage.iter().map(|name| self.get(name)).collect()
    }

    /// Backends that carry a retention threshold, sorted by name.
    pub fn with_retention(&self) -> Vec<(Arc<dyn Storage>, u64)> {
        let mut swept: Vec<_> = self
            .retention
            .iter()
            .filter_map(|(name, days)| self.backends.get(name).map(|b| (b.clone(), *days)))
            .collect();
        swept.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        swept
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn build_backend(settings: &StorageSettings) -> Arc<dyn Storage> {
    match &settings.kind {
        StorageKind::Local { path } => Arc::new(LocalStorage::new(&settings.name, path)),
        StorageKind::S3(spaces) => Arc::new(S3Storage::connect(&settings.name, spaces).await),
    }
}

/// Object name for the archive of one backup run. Multiple backends get a
/// 1-based position suffix so copies never share a name.
pub fn archive_name(db_ident: &str, backup_id: &str, position: usize, backend_count: usize) -> String {
    if backend_count > 1 {
        format!("{}/{}-{}.tar.gz", db_ident, backup_id, position)
    } else {
        format!("{}/{}.tar.gz", db_ident, backup_id)
    }
}
