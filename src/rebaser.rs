//! Minimum plannable revision of open pull requests.
//!
//! After a root is deployed, every open pull request that touches the root
//! gets a commit status naming the deployed revision, so a plan is never made
//! against a base older than what is live.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern, PatternError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::effects::{GitHubEffect, GitHubInterpreter, GitHubResponse, PullRequestData};
use crate::feature::{Allocator, FeatureContext, FeatureName};
use crate::types::{DeploymentInfo, PrNumber, Repo, Root, Sha};
use crate::worker::post_deploy::{PostDeployError, PostDeployExecutor};

/// Files that make a pull request relevant to a root without its own list.
pub const DEFAULT_TRACKED_FILES: [&str; 3] = ["**/*.tf", "**/*.tfvars", "**/*.hcl"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Error)]
pub enum RebaseError {
    #[error("invalid tracked file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: PatternError,
    },

    #[error("failed to list open pull requests: {0}")]
    ListPrs(String),
}

/// Decides whether a changed file belongs to a root.
#[derive(Debug, Clone)]
pub struct RootMatcher {
    prefix: String,
    patterns: Vec<Pattern>,
}

impl RootMatcher {
    pub fn new(root: &Root) -> Result<Self, RebaseError> {
        let sources: Vec<&str> = if root.tracked_files.is_empty() {
            DEFAULT_TRACKED_FILES.to_vec()
        } else {
            root.tracked_files.iter().map(String::as_str).collect()
        };
        let patterns = sources
            .into_iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| RebaseError::Pattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let path = root.path.trim_matches('/');
        let prefix = match path {
            "" | "." => String::new(),
            path => format!("{}/", path),
        };
        Ok(RootMatcher { prefix, patterns })
    }

    /// `file` is repository-relative; patterns apply below the root's path.
    pub fn matches(&self, file: &str) -> bool {
        let Some(relative) = file.strip_prefix(&self.prefix) else {
            return false;
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebaseSummary {
    pub considered: usize,
    pub updated: Vec<PrNumber>,
    pub untouched: usize,
    pub failed: Vec<PrNumber>,
}

pub struct PullRebaser<G> {
    github: G,
}

impl<G> PullRebaser<G>
where
    G: GitHubInterpreter + Sync,
    G::Error: Display + Send,
{
    pub fn new(github: G) -> Self {
        PullRebaser { github }
    }

    /// Marks `revision` as the minimum plannable revision of every open pull
    /// request against the default branch that touches `root`.
    ///
    /// A failure on one pull request is counted and the batch continues.
    #[instrument(skip_all, fields(repo = %repo, root = %root.name, revision = %revision))]
    pub async fn rebase(&self, repo: &Repo, root: &Root, revision: &Sha) -> Result<RebaseSummary, RebaseError> {
        let matcher = RootMatcher::new(root)?;
        let prs = self.open_prs(repo).await?;
        let mut summary = RebaseSummary {
            considered: prs.len(),
            ..RebaseSummary::default()
        };

        for pr in prs {
            match self.update_pr(&matcher, &pr, revision).await {
                Ok(true) => summary.updated.push(pr.number),
                Ok(false) => summary.untouched += 1,
                Err(e) => {
                    warn!(pr = %pr.number, error = %e, "failed to set minimum revision");
                    summary.failed.push(pr.number);
                }
            }
        }

        info!(
            considered = summary.considered,
            updated = summary.updated.len(),
            failed = summary.failed.len(),
            "pull requests rebased"
        );
        Ok(summary)
    }

    async fn open_prs(&self, repo: &Repo) -> Result<Vec<PullRequestData>, RebaseError> {
        let effect = GitHubEffect::ListOpenPrs {
            base: repo.default_branch.clone(),
        };
        match self.github.interpret(effect).await {
            Ok(GitHubResponse::PrList(prs)) => Ok(prs),
            Ok(other) => Err(RebaseError::ListPrs(format!("unexpected response {:?}", other))),
            Err(e) => Err(RebaseError::ListPrs(e.to_string())),
        }
    }

    /// Returns whether the pull request touches the root (and was updated).
    async fn update_pr(&self, matcher: &RootMatcher, pr: &PullRequestData, revision: &Sha) -> Result<bool, String> {
        let files = match self
            .github
            .interpret(GitHubEffect::ListModifiedFiles { pr: pr.number })
            .await
        {
            Ok(GitHubResponse::ModifiedFiles(files)) => files,
            Ok(other) => return Err(format!("unexpected response {:?}", other)),
            Err(e) => return Err(e.to_string()),
        };

        if !files.iter().any(|f| matcher.matches(f)) {
            debug!(pr = %pr.number, files = files.len(), "pull request does not touch root");
            return Ok(false);
        }

        let effect = GitHubEffect::SetPrRevision {
            pr: pr.number,
            head_sha: pr.head_sha.clone(),
            revision: revision.clone(),
        };
        self.github
            .interpret(effect)
            .await
            .map(|_| true)
            .map_err(|e| e.to_string())
    }
}

/// Post-deploy hook running the [`PullRebaser`] for the deployed root.
pub struct PrRevisionSetter<G> {
    rebaser: PullRebaser<G>,
    allocator: Arc<dyn Allocator>,
}

impl<G> PrRevisionSetter<G> {
    pub fn new(rebaser: PullRebaser<G>, allocator: Arc<dyn Allocator>) -> Self {
        PrRevisionSetter { rebaser, allocator }
    }
}

#[async_trait]
impl<G> PostDeployExecutor for PrRevisionSetter<G>
where
    G: GitHubInterpreter + Send + Sync,
    G::Error: Display + Send,
{
    fn name(&self) -> &'static str {
        "pr-revision-setter"
    }

    async fn execute(&self, info: &DeploymentInfo) -> Result<(), PostDeployError> {
        let ctx = FeatureContext::root(info.repo.id(), info.root.name.clone());
        if !self.allocator.should_allocate(FeatureName::PrRevisionSetter, &ctx) {
            debug!(root = %info.root.name, "pr revision setter disabled");
            return Ok(());
        }
        self.rebaser
            .rebase(&info.repo, &info.root, &info.commit.revision)
            .await
            .map(|_| ())
            .map_err(|e| PostDeployError {
                executor: self.name(),
                message: e.to_string(),
            })
    }
}
