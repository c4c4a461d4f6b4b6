//! Pull request plan processing.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::message::UnlockSignal;
use super::processor::{ProcessError, ProcessOutcome, RevisionProcessor};
use crate::terraform::{PlanApproval, TerraformWorkflow, TerraformWorkflowRunner};
use crate::types::{DeploymentInfo, DeploymentRecord, WorkflowMode};

/// Plans each pushed revision of a pull request. Nothing is compared,
/// applied or persisted.
pub struct PullRequestProcessor<T> {
    terraform: TerraformWorkflowRunner<T>,
}

impl<T> PullRequestProcessor<T> {
    pub fn new(terraform: TerraformWorkflowRunner<T>) -> Self {
        PullRequestProcessor { terraform }
    }
}

impl<T: TerraformWorkflow + Sync> RevisionProcessor for PullRequestProcessor<T> {
    #[instrument(skip_all, fields(deployment = %requested.id, revision = %requested.commit.revision))]
    async fn process(
        &self,
        requested: &DeploymentInfo,
        _latest: Option<DeploymentRecord>,
        _unlocks: &mut mpsc::Receiver<UnlockSignal>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ProcessError> {
        self.terraform
            .run(requested, PlanApproval::auto(), WorkflowMode::PullRequest, cancel)
            .await?;
        Ok(ProcessOutcome::default())
    }
}
