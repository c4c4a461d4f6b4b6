//! The persisted "last deployed" baseline of a root.

use serde::{Deserialize, Serialize};

use super::deployment::{DeploymentInfo, Trigger};
use super::ids::{CheckRunId, DeploymentId, RepoId, Sha};

/// Current schema version of [`DeploymentRecord`]. Increment when making breaking changes.
pub const DEPLOYMENT_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRoot {
    pub name: String,
    pub trigger: Trigger,
    pub manual_rerun: bool,
}

/// The latest deployment of a root, as stored between runner lifetimes.
///
/// The worker compares every requested revision against `revision` before
/// dispatching Terraform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub version: u32,
    pub id: DeploymentId,
    pub check_run_id: Option<CheckRunId>,
    pub revision: Sha,
    pub branch: String,
    pub root: RecordRoot,
    pub repo: RepoId,
}

impl DeploymentRecord {
    pub fn from_deployment(info: &DeploymentInfo) -> Self {
        DeploymentRecord {
            version: DEPLOYMENT_RECORD_VERSION,
            id: info.id.clone(),
            check_run_id: info.check_run_id,
            revision: info.commit.revision.clone(),
            branch: info.commit.branch.clone(),
            root: RecordRoot {
                name: info.root.name.clone(),
                trigger: info.root.trigger_info.trigger,
                manual_rerun: info.root.trigger_info.rerun,
            },
            repo: info.repo.id(),
        }
    }
}
