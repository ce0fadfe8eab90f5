//! Dump and restore commands for each supported database engine.
//!
//! Every engine shells out to the vendor client tools. Commands are built as
//! argument vectors and spawned directly, so identifiers and passwords never
//! pass through a shell.

pub(crate) mod mysql;
pub(crate) mod postgres;
pub(crate) mod sqlite;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;
use which::which;

use crate::config::{AppConfig, DatabaseConfig, DumpOptions, EngineConfig, OptionValue};
use crate::errors::{AppError, Result};
pub use mysql::MysqlEngine;
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Short engine label used in logs.
    fn kind(&self) -> &'static str;

    /// Writes one complete dump file to `output`.
    async fn dump(&self, output: &Path, options: &DumpOptions) -> Result<()>;

    /// Loads a dump produced by [`DatabaseEngine::dump`] into the live database.
    async fn restore_into(&self, input: &Path) -> Result<()>;
}

/// Engines keyed by database identifier.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn DatabaseEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        for db in config.databases.values() {
            registry.insert(&db.ident, build_engine(db)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, db_ident: &str, engine: Arc<dyn DatabaseEngine>) {
        self.engines.insert(db_ident.to_string(), engine);
    }

    pub fn get(&self, db_ident: &str) -> Result<Arc<dyn DatabaseEngine>> {
        self.engines.get(db_ident).cloned().ok_or_else(|| {
            AppError::config(format!("no database engine configured for '{}'", db_ident))
        })
    }
}

fn build_engine(db: &DatabaseConfig) -> Result<Arc<dyn DatabaseEngine>> {
    let engine: Arc<dyn DatabaseEngine> = match &db.engine {
        EngineConfig::Mysql {
            host,
            port,
            username,
            password,
            databases,
        } => Arc::new(MysqlEngine {
            host: host.clone(),
            port: *port,
            username: username.clone(),
            password: password.clone(),
            databases: databases.clone(),
            timeout: db.timeout,
        }),
        EngineConfig::Postgresql { url } => Arc::new(PostgresEngine::new(
            url,
            db.create_target_database_if_not_exists,
            db.timeout,
        )?),
        EngineConfig::Sqlite { path } => Arc::new(SqliteEngine {
            path: path.clone(),
            timeout: db.timeout,
        }),
    };
    Ok(engine)
}

/// Turns configured options into command-line flags: `true` becomes `--name`,
/// `false` is dropped, scalars become `--name=value`, lists repeat the flag.
pub fn options_to_args(options: &DumpOptions) -> Vec<String> {
    let mut args = Vec::new();
    for (name, value) in options {
        let flag = name.trim_start_matches('-');
        match value {
            OptionValue::Flag(true) => args.push(format!("--{}", flag)),
            OptionValue::Flag(false) => {}
            OptionValue::Number(n) => args.push(format!("--{}={}", flag, n)),
            OptionValue::Text(text) => args.push(format!("--{}={}", flag, text)),
            OptionValue::List(items) => {
                args.extend(items.iter().map(|item| format!("--{}={}", flag, item)))
            }
        }
    }
    args
}

pub(crate) fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| {
        AppError::execution(format!(
            "{} executable not found in PATH ({}). Please ensure the database client tools are installed.",
            name, e
        ))
    })
}

pub(crate) fn stdio_from_file(path: &Path, write: bool) -> Result<Stdio> {
    let file = if write {
        std::fs::File::create(path)?
    } else {
        std::fs::File::open(path)?
    };
    Ok(Stdio::from(file))
}

/// Runs a prepared command to completion. Stdin and stdout keep whatever the
/// caller configured; stderr is captured for the error message. A nonzero
/// exit or an expired timeout is an execution error; the child is killed when
/// the timeout fires.
pub(crate) async fn run_command(mut cmd: Command, label: &str, timeout: Duration) -> Result<()> {
    cmd.stderr(Stdio::piped()).kill_on_drop(true);
    debug!(command = label, timeout_secs = timeout.as_secs(), "running external command");

    let child = cmd
        .spawn()
        .map_err(|e| AppError::execution(format!("failed to start {}: {}", label, e)))?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|e| AppError::execution(format!("failed to wait for {}: {}", label, e)))?,
        Err(_) => {
            return Err(AppError::execution(format!(
                "{} timed out after {}s",
                label,
                timeout.as_secs()
            )));
        }
    };

    if !output.status.success() {
        return Err(AppError::execution(format!(
            "{} failed with status: {}\nStderr: {}",
            label,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_to_args() {
        let mut options = DumpOptions::new();
        options.insert("single-transaction".to_string(), OptionValue::Flag(true));
        options.insert("skip-lock-tables".to_string(), OptionValue::Flag(false));
        options.insert("max_allowed_packet".to_string(), OptionValue::Text("512M".to_string()));
        options.insert("--compress".to_string(), OptionValue::Number(6));
        options.insert(
            "ignore-table".to_string(),
            OptionValue::List(vec!["orders.audit".to_string(), "orders.tmp".to_string()]),
        );

        assert_eq!(
            options_to_args(&options),
            vec![
                "--compress=6",
                "--ignore-table=orders.audit",
                "--ignore-table=orders.tmp",
                "--max_allowed_packet=512M",
                "--single-transaction",
            ]
        );
    }

    #[test]
    fn test_registry_unknown_database_is_config_error() {
        let registry = EngineRegistry::new();
        assert!(matches!(registry.get("orders_db"), Err(AppError::Config(_))));
    }

    #[test]
    fn test_missing_executable_is_execution_error() {
        assert!(matches!(
            find_executable("dbkeeper-no-such-tool"),
            Err(AppError::Execution(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_reports_nonzero_exit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = run_command(cmd, "sh", Duration::from_secs(10)).await.unwrap_err();
        match err {
            AppError::Execution(msg) => assert!(msg.contains("boom"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_command(cmd, "sleep", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, AppError::Execution(ref msg) if msg.contains("timed out")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_keeps_stdout_redirect() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let out = dir.path().join("dump.sql");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'INSERT INTO items VALUES (1);'"])
            .stdout(stdio_from_file(&out, true)?);
        run_command(cmd, "sh", Duration::from_secs(10)).await?;
        assert_eq!(
            std::fs::read_to_string(&out)?.trim(),
            "INSERT INTO items VALUES (1);"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_success() -> anyhow::Result<()> {
        run_command(Command::new("true"), "true", Duration::from_secs(10)).await?;
        Ok(())
    }
}
