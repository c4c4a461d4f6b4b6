//! Retrying, supervised execution of a [`TerraformWorkflow`].

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::supervisor::supervise;
use super::{ApplicationError, PlanApproval, TerraformRequest, TerraformResponse, TerraformWorkflow};
use crate::notifier::StateReceiver;
use crate::retry::{RetryConfig, RetryResult, retry_with_backoff};
use crate::types::{DeploymentInfo, WorkflowMode};

/// Attempts per run, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// A human rejected the plan. Never retried; the revision is not recorded as deployed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plan rejected: {message}")]
pub struct PlanRejectionError {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum TerraformRunError {
    #[error(transparent)]
    PlanRejected(#[from] PlanRejectionError),

    #[error("terraform workflow failed after {attempts} attempt(s): {source}")]
    Workflow {
        #[source]
        source: ApplicationError,
        attempts: u32,
    },
}

impl TerraformRunError {
    pub fn is_plan_rejection(&self) -> bool {
        matches!(self, TerraformRunError::PlanRejected(_))
    }
}

/// Runs execution units on behalf of one worker.
pub struct TerraformWorkflowRunner<T> {
    workflow: T,
    receiver: StateReceiver,
    retry: RetryConfig,
}

impl<T: TerraformWorkflow + Sync> TerraformWorkflowRunner<T> {
    pub fn new(workflow: T, receiver: StateReceiver) -> Self {
        TerraformWorkflowRunner {
            workflow,
            receiver,
            retry: RetryConfig::new(
                MAX_ATTEMPTS - 1,
                Duration::from_secs(5),
                Duration::from_secs(60),
                2.0,
            ),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn workflow(&self) -> &T {
        &self.workflow
    }

    pub fn receiver(&self) -> &StateReceiver {
        &self.receiver
    }

    /// Runs the workflow for `info`, forwarding every state update to the
    /// receiver while it runs.
    #[instrument(
        skip_all,
        fields(
            repo = %info.repo,
            root = %info.root.name,
            trigger = %info.trigger(),
            revision = %info.commit.revision,
            ?mode,
        )
    )]
    pub async fn run(
        &self,
        info: &DeploymentInfo,
        approval: PlanApproval,
        mode: WorkflowMode,
        cancel: &CancellationToken,
    ) -> Result<TerraformResponse, TerraformRunError> {
        let search_attributes = search_attributes(info);
        let mut attempts = 0;

        let result = retry_with_backoff(self.retry, || {
            attempts += 1;
            let request = TerraformRequest {
                deployment: info.clone(),
                approval: approval.clone(),
                mode,
                search_attributes: search_attributes.clone(),
                cancel: cancel.child_token(),
            };
            self.attempt(request)
        })
        .await;

        match result {
            RetryResult::Success(response) => {
                info!(attempts, applied = response.applied, "terraform workflow complete");
                Ok(response)
            }
            RetryResult::PermanentError(e) if e.is_plan_rejection() => {
                info!(message = %e.message, "plan rejected");
                Err(PlanRejectionError { message: e.message }.into())
            }
            RetryResult::PermanentError(source) => {
                warn!(error = %source, attempts, "terraform workflow failed");
                Err(TerraformRunError::Workflow { source, attempts })
            }
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                warn!(error = %last_error, attempts, "terraform workflow failed, retries exhausted");
                Err(TerraformRunError::Workflow {
                    source: last_error,
                    attempts,
                })
            }
        }
    }

    async fn attempt(&self, request: TerraformRequest) -> Result<TerraformResponse, ApplicationError> {
        let deployment = request.deployment.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = &self.receiver;
        let info = &deployment;
        supervise(self.workflow.run(request, tx), &mut rx, move |state| {
            receiver.receive(state, info)
        })
        .await
    }
}

fn search_attributes(info: &DeploymentInfo) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("repo".to_string(), info.repo.to_string()),
        ("root".to_string(), info.root.name.clone()),
        ("trigger".to_string(), info.trigger().to_string()),
        ("revision".to_string(), info.commit.revision.to_string()),
    ])
}
