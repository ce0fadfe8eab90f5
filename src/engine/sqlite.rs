use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{DatabaseEngine, find_executable, options_to_args, run_command, stdio_from_file};
use crate::config::DumpOptions;
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct SqliteEngine {
    pub path: PathBuf,
    pub timeout: Duration,
}

impl SqliteEngine {
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".restore-staging");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DatabaseEngine for SqliteEngine {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn dump(&self, output: &Path, options: &DumpOptions) -> Result<()> {
        let sqlite3 = find_executable("sqlite3")?;
        info!(path = %self.path.display(), "dumping sqlite");

        let mut cmd = Command::new(sqlite3);
        cmd.args(options_to_args(options))
            .arg(&self.path)
            .arg(".dump")
            .stdout(stdio_from_file(output, true)?);
        run_command(cmd, "sqlite3 .dump", self.timeout).await
    }

    /// Replays the dump into a fresh staging file, then swaps it over the live
    /// database so a failed restore leaves the original untouched.
    async fn restore_into(&self, input: &Path) -> Result<()> {
        let sqlite3 = find_executable("sqlite3")?;
        let staging = self.staging_path();
        info!(path = %self.path.display(), file = %input.display(), "restoring sqlite dump");

        match tokio::fs::remove_file(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut cmd = Command::new(sqlite3);
        cmd.arg("-bail")
            .arg(&staging)
            .stdin(stdio_from_file(input, false)?);
        if let Err(e) = run_command(cmd, "sqlite3", self.timeout).await {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                warn!(path = %staging.display(), error = %cleanup, "failed to remove staging database");
            }
            return Err(e);
        }

        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}
