//! An execution unit that runs Terraform on a local checkout.

use std::path::Path;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::checkout::{Checkout, CheckoutError, GitCheckout};
use super::executor::{ExecError, Executor, TerraformCommand};
use super::review::{PlanReview, PlanReviews};
use super::{ApplicationError, TerraformRequest, TerraformResponse, TerraformWorkflow};
use crate::types::{CompletionReason, Job, JobAction, JobStatus, WorkflowMode, WorkflowState};

pub const TERRAFORM_CLIENT_ERROR_TYPE: &str = "TerraformClientError";
pub const CHECKOUT_ERROR_TYPE: &str = "CheckoutError";
pub const CANCELED_ERROR_TYPE: &str = "CanceledError";

/// Runs init, plan and (in deploy mode) apply in the deployment's own
/// checkout of its revision, released once the attempt is over.
///
/// Plans that need manual approval wait for a [`PlanReview`] before apply.
pub struct LocalTerraformWorkflow<E, C = GitCheckout> {
    executor: E,
    checkout: C,
    reviews: PlanReviews,
}

impl<E, C> LocalTerraformWorkflow<E, C> {
    pub fn new(executor: E, checkout: C, reviews: PlanReviews) -> Self {
        LocalTerraformWorkflow {
            executor,
            checkout,
            reviews,
        }
    }
}

fn exec_failure(err: ExecError) -> ApplicationError {
    match err {
        ExecError::Cancelled { .. } => ApplicationError::new(CANCELED_ERROR_TYPE, err.to_string()),
        // The binary or checkout was not usable; worth another attempt.
        ExecError::Spawn { .. } => ApplicationError::retryable(TERRAFORM_CLIENT_ERROR_TYPE, err.to_string()),
        ExecError::Failed { .. } => ApplicationError::new(TERRAFORM_CLIENT_ERROR_TYPE, err.to_string()),
    }
}

fn checkout_failure(err: &CheckoutError) -> ApplicationError {
    match err {
        CheckoutError::Cancelled => ApplicationError::new(CANCELED_ERROR_TYPE, err.to_string()),
        e if e.is_invalid_request() => ApplicationError::new(CHECKOUT_ERROR_TYPE, err.to_string()),
        _ => ApplicationError::retryable(CHECKOUT_ERROR_TYPE, err.to_string()),
    }
}

fn completion_for(err: &ExecError) -> CompletionReason {
    match err {
        ExecError::Cancelled { .. } => CompletionReason::Unknown,
        _ => CompletionReason::InternalServiceError,
    }
}

fn publish(states: &mpsc::UnboundedSender<WorkflowState>, state: &WorkflowState) {
    // The supervisor may already be gone if the parent was torn down.
    let _ = states.send(state.clone());
}

impl<E: Executor + Sync, C: Checkout + Sync> TerraformWorkflow for LocalTerraformWorkflow<E, C> {
    async fn run(
        &self,
        request: TerraformRequest,
        states: mpsc::UnboundedSender<WorkflowState>,
    ) -> Result<TerraformResponse, ApplicationError> {
        let mut state = WorkflowState::new(request.mode);
        state.plan = Some(Job::started(Utc::now()));
        publish(&states, &state);

        let result = match self.checkout.prepare(&request.deployment, &request.cancel).await {
            Ok(workdir) => self.run_in(&workdir, &request, state, &states).await,
            Err(e) => {
                warn!(deployment = %request.deployment.id, error = %e, "checkout failed");
                if let Some(job) = &mut state.plan {
                    job.finish(JobStatus::Failed, Utc::now(), Some(e.to_string()));
                }
                state.complete(match e {
                    CheckoutError::Cancelled => CompletionReason::Unknown,
                    _ => CompletionReason::InternalServiceError,
                });
                publish(&states, &state);
                Err(checkout_failure(&e))
            }
        };
        self.checkout.release(&request.deployment).await;
        result
    }
}

impl<E: Executor + Sync, C: Checkout + Sync> LocalTerraformWorkflow<E, C> {
    async fn run_in(
        &self,
        workdir: &Path,
        request: &TerraformRequest,
        mut state: WorkflowState,
        states: &mpsc::UnboundedSender<WorkflowState>,
    ) -> Result<TerraformResponse, ApplicationError> {
        let cancel = &request.cancel;

        let plan = async {
            self.executor
                .execute(TerraformCommand::Init, workdir, cancel)
                .await?;
            self.executor
                .execute(TerraformCommand::Plan, workdir, cancel)
                .await
        }
        .await;

        let plan_output = match plan {
            Ok(output) => output,
            Err(e) => {
                if let Some(job) = &mut state.plan {
                    job.finish(JobStatus::Failed, Utc::now(), Some(e.to_string()));
                }
                state.complete(completion_for(&e));
                publish(states, &state);
                return Err(exec_failure(e));
            }
        };
        if let Some(job) = &mut state.plan {
            job.finish(JobStatus::Success, Utc::now(), Some(plan_output.clone()));
        }

        if request.mode == WorkflowMode::PullRequest {
            state.complete(CompletionReason::SuccessfulCompletion);
            publish(states, &state);
            return Ok(TerraformResponse {
                plan_output: Some(plan_output),
                applied: false,
            });
        }

        if request.approval.is_manual() {
            let mut apply = Job::started(Utc::now());
            apply.wait_for(vec![JobAction::confirm(), JobAction::reject()]);
            apply.output = Some(request.approval.reason.clone());
            state.apply = Some(apply);
            publish(states, &state);

            match self.reviews.wait(&request.deployment.id, cancel).await {
                Some(PlanReview::Confirm { user }) => {
                    info!(deployment = %request.deployment.id, user = %user, "plan confirmed");
                }
                Some(PlanReview::Reject { user }) => {
                    let message = format!("plan rejected by {}", user);
                    if let Some(job) = &mut state.apply {
                        job.finish(JobStatus::Failed, Utc::now(), Some(message.clone()));
                    }
                    state.complete(CompletionReason::PlanRejected);
                    publish(states, &state);
                    return Err(ApplicationError::plan_rejected(message));
                }
                None => {
                    warn!(deployment = %request.deployment.id, "cancelled while waiting for plan review");
                    state.complete(CompletionReason::Unknown);
                    publish(states, &state);
                    return Err(ApplicationError::new(
                        CANCELED_ERROR_TYPE,
                        "cancelled while waiting for plan review",
                    ));
                }
            }
        }

        state.apply = Some(Job::started(Utc::now()));
        publish(states, &state);

        match self
            .executor
            .execute(TerraformCommand::Apply, workdir, cancel)
            .await
        {
            Ok(output) => {
                if let Some(job) = &mut state.apply {
                    job.finish(JobStatus::Success, Utc::now(), Some(output));
                }
                state.complete(CompletionReason::SuccessfulCompletion);
                publish(states, &state);
                Ok(TerraformResponse {
                    plan_output: Some(plan_output),
                    applied: true,
                })
            }
            Err(e) => {
                if let Some(job) = &mut state.apply {
                    job.finish(JobStatus::Failed, Utc::now(), Some(e.to_string()));
                }
                state.complete(completion_for(&e));
                publish(states, &state);
                Err(exec_failure(e))
            }
        }
    }
}
