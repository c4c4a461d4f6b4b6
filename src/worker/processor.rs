//! Processing of one dequeued revision.

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::UnlockSignal;
use super::queue::LockState;
use crate::effects::CommitDirection;
use crate::notifier::CheckRunError;
use crate::persistence::StoreError;
use crate::terraform::TerraformRunError;
use crate::types::{DeploymentInfo, DeploymentRecord, Sha};

/// What a successfully processed revision changes for the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The new deployed baseline, if it changed.
    pub record: Option<DeploymentRecord>,
    /// A lock to apply to queued merge revisions.
    pub lock_merged_items: Option<LockState>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to fetch latest deployment")]
    FetchLatest(#[source] StoreError),

    #[error("failed to compare revisions: {0}")]
    Compare(String),

    #[error("revision {requested} is behind deployed revision {latest}")]
    Behind { requested: Sha, latest: Sha },

    #[error("rerun of {requested} refused: revision is {direction} of the deployed revision")]
    RerunNotIdentical {
        requested: Sha,
        direction: CommitDirection,
    },

    #[error(transparent)]
    Terraform(#[from] TerraformRunError),

    #[error("failed to store deployment")]
    Persist(#[source] StoreError),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    CheckRun(#[from] CheckRunError),
}

impl ProcessError {
    pub fn is_plan_rejection(&self) -> bool {
        matches!(self, ProcessError::Terraform(e) if e.is_plan_rejection())
    }
}

/// Decides what to do with one revision and does it.
///
/// `latest` is the worker's in-memory baseline (`None` until first fetched).
/// `unlocks` is the worker's unlock channel, for processors that must wait
/// for a human before continuing.
pub trait RevisionProcessor {
    fn process(
        &self,
        requested: &DeploymentInfo,
        latest: Option<DeploymentRecord>,
        unlocks: &mut mpsc::Receiver<UnlockSignal>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ProcessOutcome, ProcessError>> + Send;
}
