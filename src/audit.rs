//! Audit Event Log: append-only record of stage starts and completions.
//!
//! Records are newline-delimited JSON with exactly four fields:
//!
//! ```text
//! {"timestamp":"2025-01-01T12:00:00.000Z","type":"STEP_STARTED","step":"upload","data":{...}}
//! ```
//!
//! Recording is best-effort: the executor logs a warning when a sink fails
//! and carries on with the stage.

use crate::error::DocflowError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    StepStarted,
    StepCompleted,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::StepStarted => "STEP_STARTED",
            AuditEventType::StepCompleted => "STEP_COMPLETED",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub step: String,
    pub data: Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, step: impl Into<String>, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            step: step.into(),
            data,
        }
    }

    pub fn started(step: impl Into<String>, input: Value) -> Self {
        Self::new(AuditEventType::StepStarted, step, input)
    }

    pub fn completed(step: impl Into<String>, output: Value) -> Self {
        Self::new(AuditEventType::StepCompleted, step, output)
    }
}

/// RFC3339 timestamps with millisecond precision and a `Z` suffix.
mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Destination for audit records. Must accept concurrent writers.
///
/// `record` is synchronous and is called inline from stage tasks, so it
/// should return quickly.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), DocflowError>;
}

/// Append-only NDJSON file.
///
/// Each record is serialised in full and written with a single `write_all`
/// under a mutex, so concurrent stages never interleave lines. The write is
/// a blocking `std::fs` append of one short line, done on the calling task's
/// runtime thread; it holds the lock only for that write.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    /// Open `path` for appending, creating it and its parent directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DocflowError> {
        let path = path.into();
        let io_err = |source| DocflowError::AuditWriteFailed {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        debug!(path = %path.display(), "Audit log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: &AuditEvent) -> Result<(), DocflowError> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| DocflowError::Internal(format!("Audit event not serializable: {}", e)))?;
        line.push(b'\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| DocflowError::Internal("Audit log mutex poisoned".into()))?;
        file.write_all(&line)
            .map_err(|source| DocflowError::AuditWriteFailed {
                path: self.path.clone(),
                source,
            })
    }
}

/// In-process sink, handy for tests and for embedding callers.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far, in emission order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, event: &AuditEvent) -> Result<(), DocflowError> {
        self.events
            .lock()
            .map_err(|_| DocflowError::Internal("Audit log mutex poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

/// Parse an NDJSON audit log. Blank lines are ignored.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, DocflowError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|_| DocflowError::NotFound {
        path: path.to_path_buf(),
    })?;

    let mut events = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| DocflowError::ParseError {
            path: path.to_path_buf(),
            detail: format!("line {}: {}", n + 1, e),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|e| DocflowError::ParseError {
            path: path.to_path_buf(),
            detail: format!("line {}: {}", n + 1, e),
        })?;
        events.push(event);
    }
    Ok(events)
}
