//! Terraform execution units and their supervision.
//!
//! A [`TerraformWorkflow`] runs plan (and, in deploy mode, apply) for one
//! deployment, publishing a [`WorkflowState`] snapshot on every job
//! transition. The [`TerraformWorkflowRunner`] retries failed attempts and
//! forwards every snapshot to the notifiers while the unit is still running.

pub mod checkout;
pub mod executor;
pub mod local;
pub mod review;
pub mod runner;
pub mod supervisor;

use std::collections::BTreeMap;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::retry::Retriable;
use crate::types::{DeploymentInfo, WorkflowMode, WorkflowState};

pub use checkout::{Checkout, CheckoutError, GitCheckout};
pub use executor::{CommandExecutor, ExecError, Executor, TerraformCommand};
pub use local::LocalTerraformWorkflow;
pub use review::{PlanReview, PlanReviews};
pub use runner::{PlanRejectionError, TerraformRunError, TerraformWorkflowRunner};
pub use supervisor::supervise;

/// `ApplicationError::error_type` of a plan a human rejected.
pub const PLAN_REJECTED_ERROR_TYPE: &str = "PlanRejectedError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanApprovalType {
    Auto,
    /// A human must confirm the plan before apply.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanApproval {
    pub kind: PlanApprovalType,
    /// Shown to the reviewer; empty for automatic approval.
    pub reason: String,
}

impl PlanApproval {
    pub fn auto() -> Self {
        PlanApproval {
            kind: PlanApprovalType::Auto,
            reason: String::new(),
        }
    }

    pub fn manual(reason: impl Into<String>) -> Self {
        PlanApproval {
            kind: PlanApprovalType::Manual,
            reason: reason.into(),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.kind == PlanApprovalType::Manual
    }
}

/// One attempt's input.
#[derive(Debug, Clone)]
pub struct TerraformRequest {
    pub deployment: DeploymentInfo,
    pub approval: PlanApproval,
    pub mode: WorkflowMode,
    /// Key/value tags identifying the run (repo, root, trigger, revision).
    pub search_attributes: BTreeMap<String, String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerraformResponse {
    pub plan_output: Option<String>,
    pub applied: bool,
}

/// A typed failure reported by an execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type}: {message}")]
pub struct ApplicationError {
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
}

impl ApplicationError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ApplicationError {
            error_type: error_type.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ApplicationError {
            retryable: true,
            ..Self::new(error_type, message)
        }
    }

    pub fn plan_rejected(message: impl Into<String>) -> Self {
        Self::new(PLAN_REJECTED_ERROR_TYPE, message)
    }

    pub fn is_plan_rejection(&self) -> bool {
        self.error_type == PLAN_REJECTED_ERROR_TYPE
    }
}

impl Retriable for ApplicationError {
    fn is_retriable(&self) -> bool {
        self.retryable && !self.is_plan_rejection()
    }
}

/// An execution unit.
///
/// Implementations send a full snapshot on `states` after every job
/// transition and must keep running until their work is actually done or
/// `request.cancel` fires.
pub trait TerraformWorkflow {
    fn run(
        &self,
        request: TerraformRequest,
        states: mpsc::UnboundedSender<WorkflowState>,
    ) -> impl Future<Output = Result<TerraformResponse, ApplicationError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_rejection_is_never_retriable() {
        let mut err = ApplicationError::plan_rejected("nope");
        err.retryable = true;
        assert!(err.is_plan_rejection());
        assert!(!err.is_retriable());
    }

    #[test]
    fn retryable_flag_drives_retries() {
        assert!(ApplicationError::retryable("TerraformClientError", "boom").is_retriable());
        assert!(!ApplicationError::new("TerraformClientError", "boom").is_retriable());
    }
}
