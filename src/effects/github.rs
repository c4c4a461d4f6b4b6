//! GitHub API effect types.
//!
//! These types describe GitHub API operations as data, without executing them.
//! An interpreter (see [`super::interpreter`]) executes them against GitHub or a fake.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{CheckRunId, PrNumber, Sha};

/// The state a check run is put into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunState {
    /// Waiting in the queue behind other revisions.
    Queued,
    Pending,
    /// A human has to click something (confirm a plan, unlock the queue).
    ActionRequired,
    Success,
    Failure,
    Skipped,
    Timeout,
}

impl CheckRunState {
    /// Terminal states are final for the deployment; their updates must land.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckRunState::Success
                | CheckRunState::Failure
                | CheckRunState::Skipped
                | CheckRunState::Timeout
        )
    }

    /// GitHub's `(status, conclusion)` pair for this state.
    pub fn as_api_status(&self) -> (&'static str, Option<&'static str>) {
        match self {
            CheckRunState::Queued => ("queued", None),
            CheckRunState::Pending => ("in_progress", None),
            CheckRunState::ActionRequired => ("completed", Some("action_required")),
            CheckRunState::Success => ("completed", Some("success")),
            CheckRunState::Failure => ("completed", Some("failure")),
            CheckRunState::Skipped => ("completed", Some("skipped")),
            CheckRunState::Timeout => ("completed", Some("timed_out")),
        }
    }
}

impl fmt::Display for CheckRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckRunState::Queued => "queued",
            CheckRunState::Pending => "pending",
            CheckRunState::ActionRequired => "action_required",
            CheckRunState::Success => "success",
            CheckRunState::Failure => "failure",
            CheckRunState::Skipped => "skipped",
            CheckRunState::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// A button rendered on a check run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckRunAction {
    /// Sent back in the `requested_action` webhook (max 20 characters).
    pub identifier: String,
    /// Button label (max 20 characters).
    pub label: String,
    /// Hover text (max 40 characters).
    pub description: String,
}

impl CheckRunAction {
    pub const UNLOCK: &'static str = "unlock";
    pub const PLAN_CONFIRM: &'static str = "plan_confirm";
    pub const PLAN_REJECT: &'static str = "plan_reject";

    pub fn unlock() -> Self {
        CheckRunAction {
            identifier: Self::UNLOCK.into(),
            label: "Unlock".into(),
            description: "Resume deploys of merged revisions".into(),
        }
    }

    pub fn plan_confirm() -> Self {
        CheckRunAction {
            identifier: Self::PLAN_CONFIRM.into(),
            label: "Confirm plan".into(),
            description: "Apply this plan".into(),
        }
    }

    pub fn plan_reject() -> Self {
        CheckRunAction {
            identifier: Self::PLAN_REJECT.into(),
            label: "Reject plan".into(),
            description: "Discard this plan".into(),
        }
    }
}

/// How `head` relates to `base` in the commit graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitDirection {
    /// `head` strictly descends from `base`.
    Ahead,
    /// `head` is an ancestor of `base`.
    Behind,
    Identical,
    /// Neither is an ancestor of the other.
    Diverged,
}

impl CommitDirection {
    /// Parses the `status` field of GitHub's compare API.
    pub fn from_api_status(status: &str) -> Option<Self> {
        match status {
            "ahead" => Some(CommitDirection::Ahead),
            "behind" => Some(CommitDirection::Behind),
            "identical" => Some(CommitDirection::Identical),
            "diverged" => Some(CommitDirection::Diverged),
            _ => None,
        }
    }
}

impl fmt::Display for CommitDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitDirection::Ahead => "ahead",
            CommitDirection::Behind => "behind",
            CommitDirection::Identical => "identical",
            CommitDirection::Diverged => "diverged",
        };
        write!(f, "{}", s)
    }
}

/// A GitHub API effect.
///
/// Effects are repo-scoped: the interpreter is constructed for one repository,
/// so effects don't carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitHubEffect {
    // ─── Check Runs ───────────────────────────────────────────────────────────
    CreateCheckRun {
        title: String,
        head_sha: Sha,
        state: CheckRunState,
        summary: String,
        actions: Vec<CheckRunAction>,
        /// Correlates the check run with the deployment that owns it.
        external_id: String,
    },

    UpdateCheckRun {
        id: CheckRunId,
        title: String,
        state: CheckRunState,
        summary: String,
        actions: Vec<CheckRunAction>,
    },

    // ─── Commits ──────────────────────────────────────────────────────────────
    /// Compare `head` against `base`.
    CompareCommits { base: Sha, head: Sha },

    // ─── Pull Requests ────────────────────────────────────────────────────────
    /// List open PRs targeting `base`.
    ListOpenPrs { base: String },

    /// List the paths a PR modifies.
    ListModifiedFiles { pr: PrNumber },

    /// Record on the PR head the minimum revision it must be planned against
    /// before it can merge.
    SetPrRevision {
        pr: PrNumber,
        head_sha: Sha,
        revision: Sha,
    },
}

impl GitHubEffect {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            GitHubEffect::CreateCheckRun { .. } => "create_check_run",
            GitHubEffect::UpdateCheckRun { .. } => "update_check_run",
            GitHubEffect::CompareCommits { .. } => "compare_commits",
            GitHubEffect::ListOpenPrs { .. } => "list_open_prs",
            GitHubEffect::ListModifiedFiles { .. } => "list_modified_files",
            GitHubEffect::SetPrRevision { .. } => "set_pr_revision",
        }
    }
}

// ─── Response Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunData {
    pub id: CheckRunId,
    /// GitHub's status string as returned (`queued`, `in_progress`, `completed`).
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestData {
    pub number: PrNumber,
    pub head_sha: Sha,
    pub base_ref: String,
}

/// Response from a GitHub effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitHubResponse {
    CheckRun(CheckRunData),
    Comparison(CommitDirection),
    PrList(Vec<PullRequestData>),
    ModifiedFiles(Vec<String>),
    /// The effect succeeded and returns no data.
    Ok,
}
