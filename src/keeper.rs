use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::engine::EngineRegistry;
use crate::errors::Result;
use crate::state::StateStore;
use crate::storage::StorageRegistry;

/// Everything a backup, restore or retention run needs, built once per process.
pub struct Keeper {
    pub config: AppConfig,
    pub store: StateStore,
    pub storages: StorageRegistry,
    pub engines: EngineRegistry,
}

impl Keeper {
    /// Opens the state file and builds every configured backend and engine.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let store = StateStore::connect(&config.state_file).await?;
        store.migrate().await?;
        let storages = StorageRegistry::from_config(&config).await?;
        let engines = EngineRegistry::from_config(&config)?;
        debug!(
            state_file = %config.state_file.display(),
            temp_dir = %config.temp_dir.display(),
            command_timeout_secs = config.command_timeout.as_secs(),
            databases = config.databases.len(),
            storages = config.storages.len(),
            "keeper ready"
        );
        Ok(Self {
            config,
            store,
            storages,
            engines,
        })
    }

    /// Claims a private directory under the working pool. The directory and
    /// everything in it is removed when the returned guard drops.
    pub async fn claim_work_dir(&self, label: &str) -> Result<WorkDir> {
        WorkDir::create(self.config.temp_dir.join(label)).await
    }
}

#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub async fn create(path: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "claimed working directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed working directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove working directory"),
        }
    }
}
