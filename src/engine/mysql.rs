use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use super::{DatabaseEngine, find_executable, options_to_args, run_command, stdio_from_file};
use crate::config::DumpOptions;
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct MysqlEngine {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Empty means every database on the server.
    pub databases: Vec<String>,
    pub timeout: Duration,
}

impl MysqlEngine {
    fn connection_args(&self) -> Vec<OsString> {
        vec![
            format!("--host={}", self.host).into(),
            format!("--port={}", self.port).into(),
            format!("--user={}", self.username).into(),
        ]
    }

    fn dump_args(&self, output: &Path, options: &DumpOptions) -> Vec<OsString> {
        let mut args = self.connection_args();
        args.extend(options_to_args(options).into_iter().map(OsString::from));

        let mut result_file = OsString::from("--result-file=");
        result_file.push(output.as_os_str());
        args.push(result_file);

        // --databases keeps CREATE DATABASE/USE statements so the dump restores without a target name.
        if self.databases.is_empty() {
            args.push("--all-databases".into());
        } else {
            args.push("--databases".into());
            args.extend(self.databases.iter().map(OsString::from));
        }
        args
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        if let Some(password) = &self.password {
            cmd.env("MYSQL_PWD", password);
        }
        cmd
    }
}

#[async_trait]
impl DatabaseEngine for MysqlEngine {
    fn kind(&self) -> &'static str {
        "mysql"
    }

    async fn dump(&self, output: &Path, options: &DumpOptions) -> Result<()> {
        let mysqldump = find_executable("mysqldump")?;
        info!(host = %self.host, databases = ?self.databases, "dumping mysql");

        let mut cmd = self.command(&mysqldump);
        cmd.args(self.dump_args(output, options));
        run_command(cmd, "mysqldump", self.timeout).await
    }

    async fn restore_into(&self, input: &Path) -> Result<()> {
        let mysql = find_executable("mysql")?;
        info!(host = %self.host, file = %input.display(), "restoring mysql dump");

        let mut cmd = self.command(&mysql);
        cmd.args(self.connection_args())
            .stdin(stdio_from_file(input, false)?);
        run_command(cmd, "mysql", self.timeout).await
    }
}
