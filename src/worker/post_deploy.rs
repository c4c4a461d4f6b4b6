//! Hooks run after a successful deploy.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::DeploymentInfo;

#[derive(Debug, Error)]
#[error("{executor}: {message}")]
pub struct PostDeployError {
    pub executor: &'static str,
    pub message: String,
}

/// Work to do once a revision is deployed. Failures never fail the deploy.
#[async_trait]
pub trait PostDeployExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, info: &DeploymentInfo) -> Result<(), PostDeployError>;
}
