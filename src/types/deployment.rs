//! The unit of work that flows through a runner's queue.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{CheckRunId, DeploymentId, RepoId, Sha};

/// What caused a revision to be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The revision landed on the default branch.
    #[default]
    Merge,
    /// A human asked for the root to be deployed at this revision.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Merge => write!(f, "merge"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger: Trigger,
    /// Only meaningful for manual triggers: redeploy an already deployed revision.
    #[serde(default)]
    pub rerun: bool,
}

impl TriggerInfo {
    pub fn merge() -> Self {
        TriggerInfo {
            trigger: Trigger::Merge,
            rerun: false,
        }
    }

    pub fn manual(rerun: bool) -> Self {
        TriggerInfo {
            trigger: Trigger::Manual,
            rerun,
        }
    }
}

/// A Terraform root: a directory in the repo planned and applied as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub name: String,
    /// Path of the root relative to the repository top level.
    pub path: String,
    /// Glob patterns, relative to `path`, of files whose modification affects this root.
    #[serde(default)]
    pub tracked_files: Vec<String>,
    #[serde(default)]
    pub trigger_info: TriggerInfo,
}

/// A root path that is absolute or climbs out of the repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("root path {0:?} must be relative and stay inside the repository")]
pub struct InvalidRootPath(pub String);

impl Root {
    /// `path` checked to stay inside the repository top level.
    pub fn relative_path(&self) -> Result<&Path, InvalidRootPath> {
        let path = Path::new(&self.path);
        let escapes = self.path.contains('\0')
            || path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(InvalidRootPath(self.path.clone()));
        }
        Ok(path)
    }

    pub fn is_manual(&self) -> bool {
        self.trigger_info.trigger == Trigger::Manual
    }

    pub fn is_rerun(&self) -> bool {
        self.is_manual() && self.trigger_info.rerun
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: Sha,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
}

impl Repo {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        default_branch: impl Into<String>,
    ) -> Self {
        Repo {
            owner: owner.into(),
            name: name.into(),
            default_branch: default_branch.into(),
        }
    }

    pub fn id(&self) -> RepoId {
        RepoId::new(&self.owner, &self.name)
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A revision of one root waiting for (or undergoing) plan/apply.
///
/// Everything except `check_run_id` is fixed when the runner receives the
/// revision; `check_run_id` is filled in by the worker right before the item
/// is pushed, and never changes once the item is in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub commit: Commit,
    pub initiating_user: String,
    pub root: Root,
    pub repo: Repo,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub check_run_id: Option<CheckRunId>,
}

impl DeploymentInfo {
    pub fn revision(&self) -> &Sha {
        &self.commit.revision
    }

    pub fn trigger(&self) -> Trigger {
        self.root.trigger_info.trigger
    }

    pub fn is_manual(&self) -> bool {
        self.root.is_manual()
    }
}
