//! Append-only audit trail of backup, restore, delete and retention events.

use serde_json::{Map, Value};
use tracing::warn;

use crate::state::{LogKind, LogRecord, StateStore};

/// Structured context attached to an audit entry.
#[derive(Debug, Clone, Default)]
pub struct AuditMeta(Map<String, Value>);

impl AuditMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_backup(db_ident: &str, backup_id: &str) -> Self {
        Self::new().with("dbIdent", db_ident).with("backupId", backup_id)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn error(self, err: &impl std::fmt::Display) -> Self {
        self.with("error", err.to_string())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Appends one entry. Audit entries never decide the outcome of an operation,
/// so a failed write is reported and swallowed.
pub async fn record(
    store: &StateStore,
    kind: LogKind,
    message: impl Into<String>,
    meta: AuditMeta,
) -> Option<LogRecord> {
    let message = message.into();
    match store.insert_log(kind, &message, meta.into_value()).await {
        Ok(log) => Some(log),
        Err(e) => {
            warn!(kind = kind.as_str(), error = %e, message, "failed to write audit log entry");
            None
        }
    }
}

/// Short human summary of an entry's meta, for table output.
pub fn summarize(meta: &Value) -> String {
    let Some(map) = meta.as_object() else {
        return meta.to_string();
    };
    map.iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
