//! GitHub check runs for deployments.
//!
//! Every deployment gets one check run per title. The cache remembers the ID
//! of each live check run so later updates patch it instead of creating a new
//! one. Once GitHub reports a check run as `completed`, its entry is dropped:
//! a completed check run is never updated again, and the next update for the
//! same key creates a fresh one.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::format::render_workflow_summary;
use super::{Notifier, NotifierError};
use crate::effects::{CheckRunAction, CheckRunState, GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::retry::RetryConfig;
use crate::types::{CheckRunId, DeploymentId, DeploymentInfo, Sha, WorkflowMode, WorkflowState};

/// Status GitHub returns for check runs that have concluded.
pub const COMPLETED_STATUS: &str = "completed";

/// Prefix of every check-run title this service creates.
pub const CHECK_RUN_PREFIX: &str = "infra-train";

#[derive(Debug, Error)]
pub enum CheckRunError {
    #[error("GitHub API error: {0}")]
    GitHub(String),

    #[error("unexpected response to {effect}: {response}")]
    UnexpectedResponse {
        effect: &'static str,
        response: String,
    },
}

/// The check-run title of a deployment.
pub fn check_run_title(info: &DeploymentInfo, mode: WorkflowMode) -> String {
    let kind = match mode {
        WorkflowMode::Deploy => "deploy",
        WorkflowMode::PullRequest => "plan",
    };
    format!("{}/{}: {}", CHECK_RUN_PREFIX, kind, info.root.name)
}

/// A desired check-run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRunRequest {
    pub title: String,
    pub head_sha: Sha,
    pub state: CheckRunState,
    pub summary: String,
    pub actions: Vec<CheckRunAction>,
}

impl CheckRunRequest {
    pub fn new(
        title: impl Into<String>,
        head_sha: Sha,
        state: CheckRunState,
        summary: impl Into<String>,
    ) -> Self {
        CheckRunRequest {
            title: title.into(),
            head_sha,
            state,
            summary: summary.into(),
            actions: Vec::new(),
        }
    }

    /// A request for the deploy check run of `info`.
    pub fn for_deployment(info: &DeploymentInfo, state: CheckRunState, summary: impl Into<String>) -> Self {
        Self::new(
            check_run_title(info, WorkflowMode::Deploy),
            info.commit.revision.clone(),
            state,
            summary,
        )
    }

    pub fn with_actions(mut self, actions: Vec<CheckRunAction>) -> Self {
        self.actions = actions;
        self
    }
}

/// Create-or-update front end for check runs, keyed by deployment and title.
pub struct CheckRunCache<G> {
    github: G,
    ids: Mutex<HashMap<String, CheckRunId>>,
}

impl<G> CheckRunCache<G>
where
    G: GitHubInterpreter + Sync,
    G::Error: Display + Send,
{
    pub fn new(github: G) -> Self {
        CheckRunCache {
            github,
            ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn github(&self) -> &G {
        &self.github
    }

    pub fn cache_key(deployment_id: &DeploymentId, title: &str) -> String {
        format!("{}_{}", deployment_id, title)
    }

    /// Creates the check run if none is cached for `(deployment_id, title)`,
    /// otherwise updates the cached one.
    ///
    /// Terminal states are retried with [`RetryConfig::RECOVERY`]; everything
    /// else gets [`RetryConfig::DEFAULT`], since a later update supersedes it.
    /// The cache lock is never held across the GitHub call.
    #[instrument(skip(self, request), fields(deployment = %deployment_id, title = %request.title, state = %request.state))]
    pub async fn create_or_update(
        &self,
        deployment_id: &DeploymentId,
        request: CheckRunRequest,
    ) -> Result<CheckRunId, CheckRunError> {
        let key = Self::cache_key(deployment_id, &request.title);
        let existing = self.ids.lock().await.get(&key).copied();

        let retry = if request.state.is_terminal() {
            RetryConfig::RECOVERY
        } else {
            RetryConfig::DEFAULT
        };
        let effect = match existing {
            Some(id) => GitHubEffect::UpdateCheckRun {
                id,
                title: request.title,
                state: request.state,
                summary: request.summary,
                actions: request.actions,
            },
            None => GitHubEffect::CreateCheckRun {
                title: request.title,
                head_sha: request.head_sha,
                state: request.state,
                summary: request.summary,
                actions: request.actions,
                external_id: deployment_id.to_string(),
            },
        };
        let effect_name = effect.name();

        let response = self
            .github
            .interpret_with_retry(effect, retry)
            .await
            .map_err(|e| CheckRunError::GitHub(e.to_string()))?;
        let data = match response {
            GitHubResponse::CheckRun(data) => data,
            other => {
                return Err(CheckRunError::UnexpectedResponse {
                    effect: effect_name,
                    response: format!("{:?}", other),
                });
            }
        };

        let mut ids = self.ids.lock().await;
        if data.status == COMPLETED_STATUS {
            ids.remove(&key);
        } else {
            ids.insert(key, data.id);
        }
        debug!(check_run = %data.id, status = %data.status, "check run written");
        Ok(data.id)
    }

    /// The cached check run for `(deployment_id, title)`, if any.
    pub async fn cached(&self, deployment_id: &DeploymentId, title: &str) -> Option<CheckRunId> {
        self.ids
            .lock()
            .await
            .get(&Self::cache_key(deployment_id, title))
            .copied()
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

/// Derives the check-run state of a workflow update.
///
/// Strict priority: a job waiting on a human wins, then an unfinished
/// workflow, then the completion reason.
pub fn determine_check_run_state(state: &WorkflowState) -> CheckRunState {
    if state.jobs().any(|job| job.needs_action()) {
        return CheckRunState::ActionRequired;
    }
    if !state.is_complete() {
        return CheckRunState::Pending;
    }
    match state.result.reason {
        crate::types::CompletionReason::SuccessfulCompletion => CheckRunState::Success,
        crate::types::CompletionReason::SkippedCompletion => CheckRunState::Skipped,
        reason if reason.is_timeout() => CheckRunState::Timeout,
        _ => CheckRunState::Failure,
    }
}

/// Mirrors workflow updates into the deployment's check run.
pub struct CheckRunNotifier<G> {
    cache: Arc<CheckRunCache<G>>,
}

impl<G> CheckRunNotifier<G> {
    pub fn new(cache: Arc<CheckRunCache<G>>) -> Self {
        CheckRunNotifier { cache }
    }
}

#[async_trait]
impl<G> Notifier for CheckRunNotifier<G>
where
    G: GitHubInterpreter + Send + Sync,
    G::Error: Display + Send,
{
    fn name(&self) -> &'static str {
        "check_run"
    }

    async fn notify(&self, info: &DeploymentInfo, state: &WorkflowState) -> Result<(), NotifierError> {
        let check_state = determine_check_run_state(state);
        let actions = if check_state == CheckRunState::ActionRequired {
            vec![CheckRunAction::plan_confirm(), CheckRunAction::plan_reject()]
        } else {
            Vec::new()
        };
        let request = CheckRunRequest::new(
            check_run_title(info, state.mode),
            info.commit.revision.clone(),
            check_state,
            render_workflow_summary(info, state),
        )
        .with_actions(actions);

        self.cache.create_or_update(&info.id, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeGitHub, deployment};
    use crate::types::{CompletionReason, Job, JobAction, JobStatus, Trigger};
    use chrono::Utc;

    fn state_with(plan: Option<Job>, complete: Option<CompletionReason>) -> WorkflowState {
        let mut state = WorkflowState::new(WorkflowMode::Deploy);
        state.plan = plan;
        if let Some(reason) = complete {
            state.complete(reason);
        }
        state
    }

    fn waiting_job() -> Job {
        let mut job = Job::started(Utc::now());
        job.wait_for(vec![JobAction::confirm()]);
        job
    }

    // ─── State Derivation ─────────────────────────────────────────────────────

    #[test]
    fn waiting_job_with_actions_requires_action_even_when_complete() {
        let state = state_with(
            Some(waiting_job()),
            Some(CompletionReason::SuccessfulCompletion),
        );
        assert_eq!(determine_check_run_state(&state), CheckRunState::ActionRequired);
    }

    #[test]
    fn in_progress_workflow_is_pending() {
        let state = state_with(Some(Job::started(Utc::now())), None);
        assert_eq!(determine_check_run_state(&state), CheckRunState::Pending);
    }

    #[test]
    fn completion_reasons_map_to_states() {
        let cases = [
            (CompletionReason::SuccessfulCompletion, CheckRunState::Success),
            (CompletionReason::SkippedCompletion, CheckRunState::Skipped),
            (CompletionReason::TimeoutError, CheckRunState::Timeout),
            (CompletionReason::HeartbeatTimeoutError, CheckRunState::Timeout),
            (CompletionReason::InternalServiceError, CheckRunState::Failure),
            (CompletionReason::PlanRejected, CheckRunState::Failure),
            (CompletionReason::Unknown, CheckRunState::Failure),
        ];
        for (reason, expected) in cases {
            let state = state_with(None, Some(reason));
            assert_eq!(determine_check_run_state(&state), expected, "{:?}", reason);
        }
    }

    #[test]
    fn waiting_job_without_actions_does_not_require_action() {
        let mut job = Job::started(Utc::now());
        job.status = JobStatus::Waiting;
        let state = state_with(Some(job), None);
        assert_eq!(determine_check_run_state(&state), CheckRunState::Pending);
    }

    // ─── Cache ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_write_creates_then_updates() {
        let github = FakeGitHub::new();
        let cache = CheckRunCache::new(github.clone());
        let id = DeploymentId::new("dep-1");

        let first = cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Queued, "q"))
            .await
            .unwrap();
        let second = cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Pending, "p"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(github.create_calls(), 1);
        assert_eq!(github.update_calls(), 1);
        assert_eq!(cache.cached(&id, "t").await, Some(first));
    }

    #[tokio::test]
    async fn completed_entry_is_evicted_and_next_write_creates() {
        let github = FakeGitHub::new();
        let cache = CheckRunCache::new(github.clone());
        let id = DeploymentId::new("dep-1");

        cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Pending, "p"))
            .await
            .unwrap();
        cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Success, "s"))
            .await
            .unwrap();
        assert_eq!(cache.len().await, 0);

        cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Pending, "p"))
            .await
            .unwrap();
        assert_eq!(github.create_calls(), 2);
        assert_eq!(github.update_calls(), 1);
    }

    #[tokio::test]
    async fn titles_and_deployments_are_keyed_separately() {
        let github = FakeGitHub::new();
        let cache = CheckRunCache::new(github.clone());
        let a = DeploymentId::new("dep-a");
        let b = DeploymentId::new("dep-b");

        for (id, title) in [(&a, "x"), (&a, "y"), (&b, "x")] {
            cache
                .create_or_update(id, CheckRunRequest::new(title, Sha::new("s"), CheckRunState::Pending, ""))
                .await
                .unwrap();
        }

        assert_eq!(github.create_calls(), 3);
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn terminal_states_use_recovery_retry() {
        let github = FakeGitHub::new();
        let cache = CheckRunCache::new(github.clone());
        let id = DeploymentId::new("dep-1");

        cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Pending, ""))
            .await
            .unwrap();
        assert_eq!(github.last_retry(), Some(RetryConfig::DEFAULT));

        cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Failure, ""))
            .await
            .unwrap();
        assert_eq!(github.last_retry(), Some(RetryConfig::RECOVERY));
    }

    #[tokio::test]
    async fn github_failure_leaves_cache_untouched() {
        let github = FakeGitHub::new();
        let cache = CheckRunCache::new(github.clone());
        let id = DeploymentId::new("dep-1");
        github.fail_next(1);

        let result = cache
            .create_or_update(&id, CheckRunRequest::new("t", Sha::new("a"), CheckRunState::Pending, ""))
            .await;

        assert!(matches!(result, Err(CheckRunError::GitHub(_))));
        assert_eq!(cache.len().await, 0);
    }

    // ─── Notifier ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn notifier_offers_plan_actions_while_waiting() {
        let github = FakeGitHub::new();
        let notifier = CheckRunNotifier::new(Arc::new(CheckRunCache::new(github.clone())));
        let info = deployment("abc", Trigger::Merge);
        let state = state_with(Some(waiting_job()), None);

        notifier.notify(&info, &state).await.unwrap();

        let effects = github.effects();
        match &effects[0] {
            GitHubEffect::CreateCheckRun {
                title,
                state,
                actions,
                external_id,
                ..
            } => {
                assert_eq!(title, "infra-train/deploy: network");
                assert_eq!(*state, CheckRunState::ActionRequired);
                assert_eq!(actions.len(), 2);
                assert_eq!(external_id, info.id.as_str());
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn pull_request_titles_say_plan() {
        let info = deployment("abc", Trigger::Merge);
        assert_eq!(
            check_run_title(&info, WorkflowMode::PullRequest),
            "infra-train/plan: network"
        );
    }
}
