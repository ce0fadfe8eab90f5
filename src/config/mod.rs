// dbkeeper/src/config/mod.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::errors::AppError;

const DEFAULT_TEMP_DIR: &str = "./dbkeeper-work";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_MYSQL_PORT: u16 = 3306;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid identifier regex"));

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonLocalStorageConfig {
    pub path: PathBuf,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonStorageConfig {
    Local(JsonLocalStorageConfig),
    S3(JsonS3StorageConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    #[serde(default)]
    pub create_target_database_if_not_exists: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonDatabaseConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: Vec<String>,
    #[serde(default)]
    pub options: DumpOptions,
    pub timeout_secs: Option<u64>,
    pub restore_options: Option<JsonRestoreOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub temp_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
    #[serde(default)]
    pub storage: HashMap<String, JsonStorageConfig>,
    #[serde(default)]
    pub databases: HashMap<String, JsonDatabaseConfig>,
}

/// A value passed through to the dump tool as `--name`, `--name=value`, or a
/// repeated `--name=item`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(i64),
    Text(String),
    List(Vec<String>),
}

pub type DumpOptions = BTreeMap<String, OptionValue>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineConfig {
    Mysql {
        host: String,
        #[serde(default = "default_mysql_port")]
        port: u16,
        username: String,
        password: Option<String>,
        #[serde(default)]
        databases: Vec<String>,
    },
    Postgresql {
        url: String,
    },
    Sqlite {
        path: PathBuf,
    },
}

fn default_mysql_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageKind {
    Local { path: PathBuf },
    S3(SpacesConfig),
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub name: String,
    pub kind: StorageKind,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub ident: String,
    pub engine: EngineConfig,
    /// Backend names in preference order.
    pub storage: Vec<String>,
    pub options: DumpOptions,
    pub timeout: Duration,
    pub create_target_database_if_not_exists: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub temp_dir: PathBuf,
    pub state_file: PathBuf,
    pub command_timeout: Duration,
    pub storages: HashMap<String, StorageSettings>,
    pub databases: HashMap<String, DatabaseConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        let config = Self::from_raw(raw_json_config)
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
        Ok(config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> std::result::Result<Self, AppError> {
        let state_file = raw
            .state_file
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| AppError::config("state_file must be set in config.json"))?;

        let command_timeout = Duration::from_secs(
            raw.command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        );

        let mut storages = HashMap::new();
        for (name, storage) in raw.storage {
            validate_ident("storage", &name)?;
            let settings = load_storage_settings(&name, storage)?;
            storages.insert(name, settings);
        }

        let mut databases = HashMap::new();
        for (ident, db) in raw.databases {
            validate_ident("database", &ident)?;
            if db.storage.is_empty() {
                return Err(AppError::config(format!(
                    "database '{}' must list at least one storage backend",
                    ident
                )));
            }
            if let Some(missing) = db.storage.iter().find(|s| !storages.contains_key(*s)) {
                return Err(AppError::config(format!(
                    "database '{}' references unknown storage '{}'",
                    ident, missing
                )));
            }
            let timeout = db
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(command_timeout);
            let restore_options = db.restore_options.unwrap_or_default();
            databases.insert(
                ident.clone(),
                DatabaseConfig {
                    ident,
                    engine: db.engine,
                    storage: db.storage,
                    options: db.options,
                    timeout,
                    create_target_database_if_not_exists: restore_options
                        .create_target_database_if_not_exists,
                },
            );
        }

        Ok(AppConfig {
            temp_dir: raw
                .temp_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
            state_file,
            command_timeout,
            storages,
            databases,
        })
    }

    /// Resolves a configured database, failing before any side effect when unknown.
    pub fn database(&self, ident: &str) -> std::result::Result<&DatabaseConfig, AppError> {
        self.databases
            .get(ident)
            .ok_or_else(|| AppError::config(format!("unknown database '{}'", ident)))
    }
}

fn validate_ident(kind: &str, name: &str) -> std::result::Result<(), AppError> {
    if IDENT_RE.is_match(name) {
        Ok(())
    } else {
        Err(AppError::config(format!(
            "invalid {} name '{}': only letters, digits, '_' and '-' are allowed",
            kind, name
        )))
    }
}

fn load_storage_settings(
    name: &str,
    raw: JsonStorageConfig,
) -> std::result::Result<StorageSettings, AppError> {
    match raw {
        JsonStorageConfig::Local(local) => {
            if local.path.as_os_str().is_empty() {
                return Err(AppError::config(format!(
                    "storage '{}': path cannot be empty",
                    name
                )));
            }
            Ok(StorageSettings {
                name: name.to_string(),
                kind: StorageKind::Local { path: local.path },
                retention_days: local.retention_days,
            })
        }
        JsonStorageConfig::S3(s3_raw) => {
            let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
            let bucket_name = non_empty(s3_raw.bucket_name).ok_or_else(|| {
                AppError::config(format!("storage '{}': bucket_name is required", name))
            })?;
            let region = non_empty(s3_raw.region).ok_or_else(|| {
                AppError::config(format!("storage '{}': region is required", name))
            })?;
            let access_key_id = non_empty(s3_raw.access_key_id);
            let secret_access_key = non_empty(s3_raw.secret_access_key);
            if access_key_id.is_some() != secret_access_key.is_some() {
                return Err(AppError::config(format!(
                    "storage '{}': access_key_id and secret_access_key must be set together",
                    name
                )));
            }
            Ok(StorageSettings {
                name: name.to_string(),
                kind: StorageKind::S3(SpacesConfig {
                    endpoint_url: non_empty(s3_raw.endpoint_url),
                    region,
                    access_key_id,
                    secret_access_key,
                    bucket_name,
                    folder_prefix: non_empty(s3_raw.folder_prefix)
                        .map(|p| p.trim_matches('/').to_string()),
                }),
                retention_days: s3_raw.retention_days,
            })
        }
    }
}
