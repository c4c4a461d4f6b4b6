//! Append-only audit trail of apply jobs.
//!
//! The log uses JSON Lines format, one [`AuditEvent`] per line, and every
//! append is fsynced: audit records are the one thing that must not be lost
//! on a crash.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::fsync::fsync_file;
use crate::types::{DeploymentId, RepoId, Sha};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditJobState {
    Started,
    Succeeded,
    Failed,
}

impl std::fmt::Display for AuditJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditJobState::Started => write!(f, "started"),
            AuditJobState::Succeeded => write!(f, "succeeded"),
            AuditJobState::Failed => write!(f, "failed"),
        }
    }
}

/// One apply-job transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Content key: the same transition of the same job always has the same key.
    pub key: String,
    pub repo: RepoId,
    pub root: String,
    pub job_id: DeploymentId,
    pub user: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub revision: Sha,
    pub state: AuditJobState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// The apply was forced by a manual trigger rather than a merge.
    pub is_force_apply: bool,
}

impl AuditEvent {
    pub fn content_key(job_id: &DeploymentId, state: AuditJobState) -> String {
        format!("{}:{}", job_id, state)
    }
}

/// Destination of audit events.
pub trait AuditSink {
    fn audit_job(&self, event: AuditEvent) -> impl Future<Output = Result<(), AuditError>> + Send;
}

/// An [`AuditSink`] appending to a JSON Lines file.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    /// Opens (or creates) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete event in the log. A torn final line is skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, AuditError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable audit line"),
            }
        }
        Ok(events)
    }
}

impl AuditSink for JsonlAuditLog {
    async fn audit_job(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())?;
        fsync_file(&file)?;
        Ok(())
    }
}
