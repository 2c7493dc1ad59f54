//! Audit log of metadata mutations
//!
//! Every mutation made in execute mode is appended as one JSON line, so an
//! operator can reconstruct how far a run got if it aborts midway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::common::Result;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunStarted,
    ShardReKeyed,
    ReferencesPropagated,
    RepairVerified,
    RunFinished,
    RunAborted,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub event: AuditEventType,
    pub shard_id: Option<String>,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Append-only JSON-lines audit logger, one per run
pub struct AuditLogger {
    run_id: String,
    file: Mutex<File>,
}

impl AuditLogger {
    /// Open (or create) the log file in append mode
    pub fn open(path: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            run_id: run_id.into(),
            file: Mutex::new(file),
        })
    }

    /// Log an audit entry
    pub fn log(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| crate::Error::Other("audit log lock poisoned".into()))?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    /// Convenience for logging an event
    pub fn log_event(
        &self,
        event: AuditEventType,
        shard_id: Option<&str>,
        message: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            event,
            shard_id: shard_id.map(str::to_string),
            message: message.into(),
            meta,
        };
        self.log(&entry)
    }
}

/// Read back every entry of an audit log
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect()
}
