//! Core domain types for the deploy and plan queues.

pub mod deployment;
pub mod ids;
pub mod record;
pub mod workflow_state;

pub use deployment::{Commit, DeploymentInfo, InvalidRootPath, Repo, Root, Trigger, TriggerInfo};
pub use ids::{CheckRunId, DeploymentId, PrNumber, RepoId, Sha};
pub use record::{DEPLOYMENT_RECORD_VERSION, DeploymentRecord, RecordRoot};
pub use workflow_state::{
    CompletionReason, Job, JobAction, JobStatus, WorkflowMode, WorkflowResult, WorkflowState,
    WorkflowStatus,
};
