//! Signal routes: new revisions, unlocks, pull request closes and plan
//! reviews.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{AppState, InvalidPathComponent, validate_path_component};
use crate::terraform::PlanReview;
use crate::types::{DeploymentId, InvalidRootPath, PrNumber, Repo, Root, Sha, TriggerInfo};
use crate::worker::{DispatchError, NewRevisionSignal, RunnerKey, RunnerSignal, UnlockSignal};

const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("{0}")]
    InvalidPath(#[from] InvalidPathComponent),

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    InvalidRootPath(#[from] InvalidRootPath),

    #[error("no plan of deployment {0} is waiting for review")]
    UnknownReview(DeploymentId),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<JsonRejection> for SignalError {
    fn from(rejection: JsonRejection) -> Self {
        SignalError::InvalidBody(rejection.body_text())
    }
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let status = match &self {
            SignalError::InvalidPath(_)
            | SignalError::InvalidBody(_)
            | SignalError::InvalidRootPath(_) => StatusCode::BAD_REQUEST,
            SignalError::UnknownReview(_) => StatusCode::NOT_FOUND,
            SignalError::Dispatch(DispatchError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            SignalError::Dispatch(DispatchError::ChannelClosed(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self, "signal not delivered");
        }
        (status, self.to_string()).into_response()
    }
}

type Accepted = (StatusCode, &'static str);

const ACCEPTED: Accepted = (StatusCode::ACCEPTED, "Accepted");

/// Body of a deploy request for one root.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRevisionRequest {
    pub revision: Sha,
    pub branch: String,
    pub initiating_user: String,
    /// Directory of the root within the repository.
    pub path: String,
    #[serde(default)]
    pub tracked_files: Vec<String>,
    #[serde(default)]
    pub trigger: TriggerInfo,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Body of a plan request for a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRevisionRequest {
    pub revision: Sha,
    pub branch: String,
    pub initiating_user: String,
    pub roots: Vec<Root>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn repo(owner: &str, name: &str, default_branch: Option<String>) -> Result<Repo, SignalError> {
    validate_path_component(owner)?;
    validate_path_component(name)?;
    Ok(Repo::new(
        owner,
        name,
        default_branch.unwrap_or_else(|| DEFAULT_BRANCH.into()),
    ))
}

pub async fn deploy_revision_handler(
    State(app_state): State<AppState>,
    Path((owner, name, root)): Path<(String, String, String)>,
    body: Result<Json<DeployRevisionRequest>, JsonRejection>,
) -> Result<Accepted, SignalError> {
    let Json(request) = body?;
    validate_path_component(&root)?;
    if request.revision.as_str().is_empty() {
        return Err(SignalError::InvalidBody("revision must not be empty".into()));
    }
    let root_dir = Root {
        name: root.clone(),
        path: request.path,
        tracked_files: request.tracked_files,
        trigger_info: request.trigger,
    };
    root_dir.relative_path()?;
    let repo = repo(&owner, &name, request.default_branch)?;
    info!(repo = %repo, root = %root, revision = %request.revision, trigger = %request.trigger.trigger, "deploy requested");

    let signal = NewRevisionSignal {
        revision: request.revision,
        branch: request.branch,
        roots: vec![root_dir],
        initiating_user: request.initiating_user,
        tags: request.tags,
    };
    app_state
        .signals()
        .signal(&RunnerKey::root(repo, root), RunnerSignal::NewRevision(signal))
        .await?;
    Ok(ACCEPTED)
}

pub async fn unlock_handler(
    State(app_state): State<AppState>,
    Path((owner, name, root)): Path<(String, String, String)>,
    body: Result<Json<UnlockSignal>, JsonRejection>,
) -> Result<Accepted, SignalError> {
    let Json(unlock) = body?;
    validate_path_component(&root)?;
    let repo = repo(&owner, &name, None)?;
    info!(repo = %repo, root = %root, user = %unlock.user, "unlock requested");

    app_state
        .signals()
        .signal(&RunnerKey::root(repo, root), RunnerSignal::Unlock(unlock))
        .await?;
    Ok(ACCEPTED)
}

pub async fn pull_request_revision_handler(
    State(app_state): State<AppState>,
    Path((owner, name, number)): Path<(String, String, u64)>,
    body: Result<Json<PullRequestRevisionRequest>, JsonRejection>,
) -> Result<Accepted, SignalError> {
    let Json(request) = body?;
    if request.roots.is_empty() {
        return Err(SignalError::InvalidBody("roots must not be empty".into()));
    }
    for root in &request.roots {
        validate_path_component(&root.name)?;
        root.relative_path()?;
    }
    let repo = repo(&owner, &name, request.default_branch)?;
    let pr = PrNumber(number);
    debug!(repo = %repo, pr = %pr, roots = request.roots.len(), "plan requested");

    let signal = NewRevisionSignal {
        revision: request.revision,
        branch: request.branch,
        roots: request.roots,
        initiating_user: request.initiating_user,
        tags: request.tags,
    };
    app_state
        .signals()
        .signal(&RunnerKey::pull_request(repo, pr), RunnerSignal::NewRevision(signal))
        .await?;
    Ok(ACCEPTED)
}

pub async fn pull_request_close_handler(
    State(app_state): State<AppState>,
    Path((owner, name, number)): Path<(String, String, u64)>,
) -> Result<Accepted, SignalError> {
    let repo = repo(&owner, &name, None)?;
    let pr = PrNumber(number);
    info!(repo = %repo, pr = %pr, "pull request closed");

    app_state
        .signals()
        .signal(&RunnerKey::pull_request(repo, pr), RunnerSignal::Close)
        .await?;
    Ok(ACCEPTED)
}

pub async fn review_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PlanReview>, JsonRejection>,
) -> Result<Accepted, SignalError> {
    let Json(review) = body?;
    validate_path_component(&id)?;
    let id = DeploymentId::new(id);

    if !app_state.reviews().resolve(&id, review).await {
        return Err(SignalError::UnknownReview(id));
    }
    Ok(ACCEPTED)
}
