//! Messages exchanged between the dispatcher, runners and workers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{DeploymentInfo, Root, Sha};

/// Messages a runner sends to its worker.
///
/// Workers receive these via `tokio::sync::mpsc` and handle them serially.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// A revision of one root to enqueue.
    Revision(DeploymentInfo),

    /// Re-publish the check runs of queued revisions.
    NotifyQueueStatus,
}

/// A human unlocked deploys of merged revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockSignal {
    pub user: String,
}

/// A new revision of one or more roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRevisionSignal {
    pub revision: Sha,
    pub branch: String,
    pub roots: Vec<Root>,
    pub initiating_user: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Signals accepted by a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSignal {
    NewRevision(NewRevisionSignal),
    Unlock(UnlockSignal),
    /// The pull request was closed (pull request runners only).
    Close,
}
