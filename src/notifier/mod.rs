//! Fan-out of Terraform workflow progress to external systems.
//!
//! Every `WorkflowState` update emitted by a Terraform run is handed to the
//! [`StateReceiver`], which calls each registered [`Notifier`] in turn:
//!
//! - [`CheckRunNotifier`] mirrors the state into the deployment's check run
//! - [`AuditNotifier`] records apply-job transitions in the audit trail
//!
//! Notification is best-effort. A failing notifier is logged and counted;
//! it never stops the others and never fails the deployment.

pub mod audit;
pub mod check_run;
pub mod format;
pub mod queue_status;
pub mod receiver;

use async_trait::async_trait;
use thiserror::Error;

use crate::persistence::AuditError;
use crate::types::{DeploymentInfo, WorkflowState};

pub use audit::AuditNotifier;
pub use check_run::{
    CheckRunCache, CheckRunError, CheckRunNotifier, CheckRunRequest, check_run_title,
    determine_check_run_state,
};
pub use queue_status::CheckRunQueueNotifier;
pub use receiver::{ReceiverStats, StateReceiver};

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("check run: {0}")]
    CheckRun(#[from] CheckRunError),

    #[error("audit: {0}")]
    Audit(#[from] AuditError),
}

/// A consumer of workflow state updates.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn notify(&self, info: &DeploymentInfo, state: &WorkflowState) -> Result<(), NotifierError>;
}
