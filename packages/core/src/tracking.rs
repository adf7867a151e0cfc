//! Append-only audit log of authentication and secret-access events.
//!
//! Each event is one JSON object on its own line. The log file is opened in
//! append mode and is never truncated or rewritten; every record is written
//! with a single `write_all` under the tracker lock so records from
//! concurrent handlers never interleave.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Kind of event recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    AuthenticationRequest,
    AuthenticationSuccess,
    AuthenticationFailure,
    SecretAccess,
    SecretAccessFailure,
}

/// One immutable audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub kind: AccessType,

    pub process_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessRecord {
    pub fn new(kind: AccessType, process_id: &str, secret_names: &[String]) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            process_id: process_id.to_string(),
            secret_names: secret_names.to_vec(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn authentication_request(process_id: &str, secret_names: &[String]) -> Self {
        Self::new(AccessType::AuthenticationRequest, process_id, secret_names)
    }

    pub fn authentication_success(process_id: &str, secret_names: &[String]) -> Self {
        Self::new(AccessType::AuthenticationSuccess, process_id, secret_names)
    }

    pub fn authentication_failure(process_id: &str, secret_names: &[String], error: impl ToString) -> Self {
        Self::new(AccessType::AuthenticationFailure, process_id, secret_names).with_error(error)
    }

    pub fn secret_access(process_id: &str, secret_names: &[String]) -> Self {
        Self::new(AccessType::SecretAccess, process_id, secret_names)
    }

    pub fn secret_access_failure(process_id: &str, secret_names: &[String], error: impl ToString) -> Self {
        Self::new(AccessType::SecretAccessFailure, process_id, secret_names).with_error(error)
    }
}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracker is closed")]
    Closed,

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to audit log: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for audit records.
pub trait Tracker: Send + Sync {
    /// Append one record.
    fn track_event(&self, record: AccessRecord) -> Result<(), TrackingError>;

    /// Flush and release the underlying resource.
    fn close(&self) -> Result<(), TrackingError>;
}

/// File-backed [`Tracker`] writing JSON Lines.
#[derive(Debug)]
pub struct FileTracker {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileTracker {
    /// Open (or create) the audit log at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Tracker for FileTracker {
    fn track_event(&self, record: AccessRecord) -> Result<(), TrackingError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut guard = self.lock();
        let file = guard.as_mut().ok_or(TrackingError::Closed)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), TrackingError> {
        let mut guard = self.lock();
        if let Some(mut file) = guard.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Read every record from an audit log.
pub fn read_records(path: impl AsRef<Path>) -> anyhow::Result<Vec<AccessRecord>> {
    use anyhow::Context;

    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read audit log: {}", path.display()))?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid audit record on line {}", index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_record_serialization_format() {
        let record = AccessRecord::secret_access_failure("42", &names(&["db"]), "boom");
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["type"], "secret_access_failure");
        assert_eq!(json["process_id"], "42");
        assert_eq!(json["secret_names"][0], "db");
        assert_eq!(json["error"], "boom");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let record = AccessRecord::authentication_request("42", &[]);
        let json = serde_json::to_string(&record).unwrap();

        assert!(!json.contains("secret_names"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_events_are_appended_one_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.log");
        let tracker = FileTracker::open(&path).unwrap();

        tracker
            .track_event(AccessRecord::authentication_request("1", &names(&["a"])))
            .unwrap();
        tracker
            .track_event(AccessRecord::authentication_success("1", &names(&["a"])))
            .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, AccessType::AuthenticationRequest);
        assert_eq!(records[1].kind, AccessType::AuthenticationSuccess);
    }

    #[test]
    fn test_reopening_never_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");

        let first = FileTracker::open(&path).unwrap();
        first.track_event(AccessRecord::secret_access("1", &[])).unwrap();
        first.close().unwrap();

        let second = FileTracker::open(&path).unwrap();
        second.track_event(AccessRecord::secret_access("2", &[])).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].process_id, "1");
        assert_eq!(records[1].process_id, "2");
    }

    #[test]
    fn test_track_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let tracker = FileTracker::open(dir.path().join("audit.log")).unwrap();
        tracker.close().unwrap();
        tracker.close().unwrap();

        let result = tracker.track_event(AccessRecord::secret_access("1", &[]));
        assert!(matches!(result, Err(TrackingError::Closed)));
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        let tracker = Arc::new(FileTracker::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let long_name = format!("secret-{}-{}-{}", t, i, "x".repeat(512));
                        tracker
                            .track_event(AccessRecord::secret_access(&t.to_string(), &[long_name]))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 400);
    }
}
