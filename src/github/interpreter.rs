//! GitHub effect interpreter using octocrab.
//!
//! Every effect maps to one REST endpoint (two or more requests when the
//! endpoint is paginated). Requests go through the client's shared lane, and
//! transient failures are retried with the caller's [`RetryConfig`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::effects::{
    CheckRunAction, CheckRunData, CheckRunState, CommitDirection, GitHubEffect, GitHubInterpreter,
    GitHubResponse, PullRequestData,
};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::types::{CheckRunId, PrNumber, Sha};

use super::client::OctocrabClient;
use super::error::GitHubApiError;

/// Status context used to publish a PR's minimum plannable revision.
pub const MINIMUM_REVISION_CONTEXT: &str = "infra-train/minimum-revision";

const PAGE_SIZE: usize = 100;

// ─── Interpreter Implementation ───────────────────────────────────────────────

impl GitHubInterpreter for OctocrabClient {
    type Error = GitHubApiError;

    async fn interpret_with_retry(
        &self,
        effect: GitHubEffect,
        retry: RetryConfig,
    ) -> Result<GitHubResponse, Self::Error> {
        let name = effect.name();
        let result = retry_with_backoff(retry, || execute_effect(self, effect.clone()))
            .await
            .into_result();

        match &result {
            Ok(_) => debug!(repo = %self.repo(), effect = name, "GitHub effect executed"),
            Err(e) => warn!(repo = %self.repo(), effect = name, error = %e, "GitHub effect failed"),
        }
        result
    }
}

/// Executes a single effect without retry logic.
async fn execute_effect(
    client: &OctocrabClient,
    effect: GitHubEffect,
) -> Result<GitHubResponse, GitHubApiError> {
    match effect {
        GitHubEffect::CreateCheckRun {
            title,
            head_sha,
            state,
            summary,
            actions,
            external_id,
        } => create_check_run(client, &title, &head_sha, state, &summary, &actions, &external_id).await,
        GitHubEffect::UpdateCheckRun {
            id,
            title,
            state,
            summary,
            actions,
        } => update_check_run(client, id, &title, state, &summary, &actions).await,
        GitHubEffect::CompareCommits { base, head } => compare_commits(client, &base, &head).await,
        GitHubEffect::ListOpenPrs { base } => list_open_prs(client, &base).await,
        GitHubEffect::ListModifiedFiles { pr } => list_modified_files(client, pr).await,
        GitHubEffect::SetPrRevision {
            pr,
            head_sha,
            revision,
        } => set_pr_revision(client, pr, &head_sha, &revision).await,
    }
}

// ─── Check Runs ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CheckRunOutput<'a> {
    title: &'a str,
    summary: &'a str,
}

#[derive(Serialize)]
struct CheckRunRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    head_sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<&'a str>,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<&'a str>,
    output: CheckRunOutput<'a>,
    actions: &'a [CheckRunAction],
}

#[derive(Debug, Deserialize)]
struct CheckRunApiResponse {
    id: u64,
    status: String,
}

impl From<CheckRunApiResponse> for GitHubResponse {
    fn from(response: CheckRunApiResponse) -> Self {
        GitHubResponse::CheckRun(CheckRunData {
            id: CheckRunId(response.id),
            status: response.status,
        })
    }
}

async fn create_check_run(
    client: &OctocrabClient,
    title: &str,
    head_sha: &Sha,
    state: CheckRunState,
    summary: &str,
    actions: &[CheckRunAction],
    external_id: &str,
) -> Result<GitHubResponse, GitHubApiError> {
    let (status, conclusion) = state.as_api_status();
    let request = CheckRunRequest {
        name: title,
        head_sha: Some(head_sha.as_str()),
        external_id: Some(external_id),
        status,
        conclusion,
        output: CheckRunOutput { title, summary },
        actions,
    };
    let url = format!("/repos/{}/{}/check-runs", client.owner(), client.repo_name());

    let _permit = client.throttle().await;
    let response: CheckRunApiResponse = client
        .inner()
        .post(&url, Some(&request))
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(response.into())
}

async fn update_check_run(
    client: &OctocrabClient,
    id: CheckRunId,
    title: &str,
    state: CheckRunState,
    summary: &str,
    actions: &[CheckRunAction],
) -> Result<GitHubResponse, GitHubApiError> {
    let (status, conclusion) = state.as_api_status();
    let request = CheckRunRequest {
        name: title,
        head_sha: None,
        external_id: None,
        status,
        conclusion,
        output: CheckRunOutput { title, summary },
        actions,
    };
    let url = format!(
        "/repos/{}/{}/check-runs/{}",
        client.owner(),
        client.repo_name(),
        id
    );

    let _permit = client.throttle().await;
    let response: CheckRunApiResponse = client
        .inner()
        .patch(&url, Some(&request))
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(response.into())
}

// ─── Commits ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompareResponse {
    status: String,
}

async fn compare_commits(
    client: &OctocrabClient,
    base: &Sha,
    head: &Sha,
) -> Result<GitHubResponse, GitHubApiError> {
    let url = format!(
        "/repos/{}/{}/compare/{}...{}",
        client.owner(),
        client.repo_name(),
        base,
        head
    );

    let _permit = client.throttle().await;
    let response: CompareResponse = client
        .inner()
        .get(&url, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;

    CommitDirection::from_api_status(&response.status)
        .map(GitHubResponse::Comparison)
        .ok_or_else(|| {
            GitHubApiError::permanent_without_source(format!(
                "unknown compare status '{}' for {}...{}",
                response.status, base, head
            ))
        })
}

// ─── Pull Requests ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PageParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    base: Option<&'a str>,
    per_page: usize,
    page: u32,
}

#[derive(Debug, Deserialize)]
struct PullApi {
    number: u64,
    head: RefApi,
    base: RefApi,
}

#[derive(Debug, Deserialize)]
struct RefApi {
    sha: String,
    #[serde(rename = "ref")]
    ref_field: String,
}

async fn list_open_prs(client: &OctocrabClient, base: &str) -> Result<GitHubResponse, GitHubApiError> {
    let url = format!("/repos/{}/{}/pulls", client.owner(), client.repo_name());
    let mut page = 1u32;
    let mut all_prs = Vec::new();

    loop {
        let params = PageParams {
            state: Some("open"),
            base: Some(base),
            per_page: PAGE_SIZE,
            page,
        };
        let _permit = client.throttle().await;
        let items: Vec<PullApi> = client
            .inner()
            .get(&url, Some(&params))
            .await
            .map_err(GitHubApiError::from_octocrab)?;
        let is_last_page = items.len() < PAGE_SIZE;

        all_prs.extend(items.into_iter().map(|pull| PullRequestData {
            number: PrNumber(pull.number),
            head_sha: Sha::new(pull.head.sha),
            base_ref: pull.base.ref_field,
        }));

        if is_last_page {
            break;
        }
        page += 1;
    }

    Ok(GitHubResponse::PrList(all_prs))
}

#[derive(Debug, Deserialize)]
struct PullFileApi {
    filename: String,
}

async fn list_modified_files(
    client: &OctocrabClient,
    pr: PrNumber,
) -> Result<GitHubResponse, GitHubApiError> {
    let url = format!(
        "/repos/{}/{}/pulls/{}/files",
        client.owner(),
        client.repo_name(),
        pr.0
    );
    let mut page = 1u32;
    let mut files = Vec::new();

    loop {
        let params = PageParams {
            state: None,
            base: None,
            per_page: PAGE_SIZE,
            page,
        };
        let _permit = client.throttle().await;
        let items: Vec<PullFileApi> = client
            .inner()
            .get(&url, Some(&params))
            .await
            .map_err(GitHubApiError::from_octocrab)?;
        let is_last_page = items.len() < PAGE_SIZE;

        files.extend(items.into_iter().map(|f| f.filename));

        if is_last_page {
            break;
        }
        page += 1;
    }

    Ok(GitHubResponse::ModifiedFiles(files))
}

#[derive(Serialize)]
struct CommitStatusRequest<'a> {
    state: &'a str,
    context: &'a str,
    description: String,
}

async fn set_pr_revision(
    client: &OctocrabClient,
    pr: PrNumber,
    head_sha: &Sha,
    revision: &Sha,
) -> Result<GitHubResponse, GitHubApiError> {
    let request = CommitStatusRequest {
        state: "pending",
        context: MINIMUM_REVISION_CONTEXT,
        description: format!("Re-plan on top of {} before merging", revision.short()),
    };
    let url = format!(
        "/repos/{}/{}/statuses/{}",
        client.owner(),
        client.repo_name(),
        head_sha
    );

    let _permit = client.throttle().await;
    let _: serde_json::Value = client
        .inner()
        .post(&url, Some(&request))
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    debug!(pr = pr.0, revision = %revision, "published minimum revision");
    Ok(GitHubResponse::Ok)
}
