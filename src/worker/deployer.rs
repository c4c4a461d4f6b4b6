//! Deploy-mode revision processing.
//!
//! # Decision Table
//!
//! The requested revision is compared with the deployed baseline:
//!
//! | Direction | Merge trigger | Manual trigger | Manual rerun |
//! |-----------|---------------|----------------|--------------|
//! | (none deployed) | deploy | deploy (confirm) | refuse |
//! | Ahead     | deploy | deploy (confirm) | refuse |
//! | Behind    | refuse | refuse | refuse |
//! | Identical | no-op, record refreshed | no-op, record refreshed | deploy (confirm) |
//! | Diverged  | wait for unlock, deploy (confirm) | deploy (confirm), then lock merges | refuse |
//!
//! "confirm" means the plan needs manual approval before apply.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::message::UnlockSignal;
use super::post_deploy::PostDeployExecutor;
use super::processor::{ProcessError, ProcessOutcome, RevisionProcessor};
use super::queue::LockState;
use crate::effects::{CheckRunAction, CheckRunState, CommitDirection, GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::notifier::format::{
    DIRECTION_BEHIND_SUMMARY, DIVERGED_SUMMARY, IDENTICAL_REVISION_SUMMARY,
    RERUN_NOT_IDENTICAL_SUMMARY, process_error_summary,
};
use crate::notifier::{CheckRunCache, CheckRunRequest};
use crate::persistence::{DeploymentStore, StoreError};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::terraform::{PlanApproval, TerraformWorkflow, TerraformWorkflowRunner};
use crate::types::{DeploymentInfo, DeploymentRecord, Sha, WorkflowMode};

/// Processes deploy requests for one root.
pub struct Deployer<G, S, T> {
    check_runs: Arc<CheckRunCache<G>>,
    store: S,
    terraform: TerraformWorkflowRunner<T>,
    post_deploy: Vec<Arc<dyn PostDeployExecutor>>,
    store_retry: RetryConfig,
    post_deploy_failures: AtomicU64,
}

impl<G, S, T> Deployer<G, S, T>
where
    G: GitHubInterpreter + Send + Sync,
    G::Error: Display + Send,
    S: DeploymentStore + Sync,
    T: TerraformWorkflow + Sync,
{
    pub fn new(check_runs: Arc<CheckRunCache<G>>, store: S, terraform: TerraformWorkflowRunner<T>) -> Self {
        Deployer {
            check_runs,
            store,
            terraform,
            post_deploy: Vec::new(),
            store_retry: RetryConfig::DEFAULT,
            post_deploy_failures: AtomicU64::new(0),
        }
    }

    pub fn with_post_deploy(mut self, executors: Vec<Arc<dyn PostDeployExecutor>>) -> Self {
        self.post_deploy = executors;
        self
    }

    pub fn with_store_retry(mut self, retry: RetryConfig) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn post_deploy_failures(&self) -> u64 {
        self.post_deploy_failures.load(Ordering::Relaxed)
    }

    async fn fetch_latest(&self, info: &DeploymentInfo) -> Result<Option<DeploymentRecord>, ProcessError> {
        let repo = &info.repo.id();
        let root = info.root.name.as_str();
        retry_with_backoff(self.store_retry, move || self.store.fetch_latest(repo, root))
            .await
            .into_result()
            .map_err(ProcessError::FetchLatest)
    }

    async fn store_latest(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        retry_with_backoff(self.store_retry, move || self.store.store_latest(record))
            .await
            .into_result()
    }

    async fn compare(&self, requested: &Sha, latest: &Sha) -> Result<CommitDirection, ProcessError> {
        let effect = GitHubEffect::CompareCommits {
            base: latest.clone(),
            head: requested.clone(),
        };
        match self.check_runs.github().interpret(effect).await {
            Ok(GitHubResponse::Comparison(direction)) => Ok(direction),
            Ok(other) => Err(ProcessError::Compare(format!("unexpected response {:?}", other))),
            Err(e) => Err(ProcessError::Compare(e.to_string())),
        }
    }

    /// Writes the deployment's check run; failures are logged only.
    async fn report(&self, info: &DeploymentInfo, state: CheckRunState, summary: &str) {
        let request = CheckRunRequest::for_deployment(info, state, summary);
        if let Err(e) = self.check_runs.create_or_update(&info.id, request).await {
            warn!(deployment = %info.id, error = %e, "failed to update check run");
        }
    }

    /// Fails the check run when `result` is an error, so it never stays queued.
    async fn failed<V>(&self, info: &DeploymentInfo, result: Result<V, ProcessError>) -> Result<V, ProcessError> {
        if let Err(e) = &result {
            self.report(info, CheckRunState::Failure, &process_error_summary(e))
                .await;
        }
        result
    }

    async fn wait_for_unlock(
        &self,
        info: &DeploymentInfo,
        unlocks: &mut mpsc::Receiver<UnlockSignal>,
        cancel: &CancellationToken,
    ) -> Result<UnlockSignal, ProcessError> {
        // Only an unlock of the check run posted below releases this revision.
        while let Ok(stale) = unlocks.try_recv() {
            debug!(user = %stale.user, "dropping unlock sent before the wait");
        }

        let request = CheckRunRequest::for_deployment(info, CheckRunState::ActionRequired, DIVERGED_SUMMARY)
            .with_actions(vec![CheckRunAction::unlock()]);
        // Without the unlock action nobody can release the wait.
        self.check_runs.create_or_update(&info.id, request).await?;

        info!(deployment = %info.id, "diverged from deployed revision, waiting for unlock");
        tokio::select! {
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
            signal = unlocks.recv() => signal.ok_or(ProcessError::Cancelled),
        }
    }

    async fn run_post_deploy(&self, info: &DeploymentInfo) {
        for executor in &self.post_deploy {
            if let Err(e) = executor.execute(info).await {
                self.post_deploy_failures.fetch_add(1, Ordering::Relaxed);
                warn!(executor = executor.name(), deployment = %info.id, error = %e, "post-deploy executor failed");
            }
        }
    }
}

fn plan_approval(
    info: &DeploymentInfo,
    direction: CommitDirection,
    latest: Option<&DeploymentRecord>,
) -> PlanApproval {
    if direction == CommitDirection::Diverged {
        let deployed = latest.map(|r| r.revision.short()).unwrap_or("unknown");
        return PlanApproval::manual(format!(
            "Revision `{}` has diverged from the deployed revision `{}`. \
             Requested by {}: confirm the plan to deploy it anyway.",
            info.commit.revision.short(),
            deployed,
            info.initiating_user
        ));
    }
    if info.is_manual() {
        return PlanApproval::manual(format!(
            "Deploy of `{}` was triggered manually by {}.",
            info.commit.revision.short(),
            info.initiating_user
        ));
    }
    PlanApproval::auto()
}

impl<G, S, T> RevisionProcessor for Deployer<G, S, T>
where
    G: GitHubInterpreter + Send + Sync,
    G::Error: Display + Send,
    S: DeploymentStore + Sync,
    T: TerraformWorkflow + Sync,
{
    #[instrument(
        skip_all,
        fields(deployment = %requested.id, root = %requested.root.name, revision = %requested.commit.revision)
    )]
    async fn process(
        &self,
        requested: &DeploymentInfo,
        latest: Option<DeploymentRecord>,
        unlocks: &mut mpsc::Receiver<UnlockSignal>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ProcessError> {
        let latest = match latest {
            Some(record) => Some(record),
            None => {
                let fetched = self.fetch_latest(requested).await;
                self.failed(requested, fetched).await?
            }
        };
        let direction = match &latest {
            None => CommitDirection::Ahead,
            Some(record) => {
                let compared = self.compare(&requested.commit.revision, &record.revision).await;
                self.failed(requested, compared).await?
            }
        };
        info!(%direction, trigger = %requested.trigger(), "compared with deployed revision");

        if direction == CommitDirection::Behind {
            self.report(requested, CheckRunState::Failure, DIRECTION_BEHIND_SUMMARY)
                .await;
            let latest = latest.map(|r| r.revision).unwrap_or_default();
            return Err(ProcessError::Behind {
                requested: requested.commit.revision.clone(),
                latest,
            });
        }

        if requested.root.is_rerun() && direction != CommitDirection::Identical {
            self.report(requested, CheckRunState::Failure, RERUN_NOT_IDENTICAL_SUMMARY)
                .await;
            return Err(ProcessError::RerunNotIdentical {
                requested: requested.commit.revision.clone(),
                direction,
            });
        }

        match direction {
            CommitDirection::Identical if !requested.root.is_rerun() => {
                let record = DeploymentRecord::from_deployment(requested);
                let stored = self.store_latest(&record).await.map_err(ProcessError::Persist);
                self.failed(requested, stored).await?;
                self.report(requested, CheckRunState::Success, IDENTICAL_REVISION_SUMMARY)
                    .await;
                return Ok(ProcessOutcome {
                    record: Some(record),
                    lock_merged_items: None,
                });
            }
            CommitDirection::Diverged if !requested.is_manual() => {
                let signal = self.wait_for_unlock(requested, unlocks, cancel).await?;
                info!(user = %signal.user, "unlocked, deploying diverged revision");
            }
            _ => {}
        }

        let approval = plan_approval(requested, direction, latest.as_ref());
        debug!(manual = approval.is_manual(), "plan approval decided");

        let record = DeploymentRecord::from_deployment(requested);
        match self
            .terraform
            .run(requested, approval, WorkflowMode::Deploy, cancel)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_plan_rejection() => return Err(e.into()),
            Err(e) => {
                // The revision reached Terraform, so it is the new baseline.
                if let Err(store_err) = self.store_latest(&record).await {
                    warn!(error = %store_err, "failed to store deployment after terraform failure");
                }
                return Err(e.into());
            }
        }

        let stored = self.store_latest(&record).await.map_err(ProcessError::Persist);
        self.failed(requested, stored).await?;
        self.run_post_deploy(requested).await;

        let lock_merged_items = (requested.is_manual() && direction == CommitDirection::Diverged)
            .then(|| LockState::locked(requested.commit.revision.clone()));
        Ok(ProcessOutcome {
            record: Some(record),
            lock_merged_items,
        })
    }
}
