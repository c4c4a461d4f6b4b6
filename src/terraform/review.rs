//! Human review of plans that need manual approval.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::DeploymentId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanReview {
    Confirm { user: String },
    Reject { user: String },
}

impl PlanReview {
    pub fn user(&self) -> &str {
        match self {
            PlanReview::Confirm { user } | PlanReview::Reject { user } => user,
        }
    }
}

/// Plans currently waiting for a decision, by deployment.
#[derive(Debug, Clone, Default)]
pub struct PlanReviews {
    pending: Arc<Mutex<HashMap<DeploymentId, oneshot::Sender<PlanReview>>>>,
}

impl PlanReviews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plan awaiting review. A previous registration for the same
    /// deployment is replaced.
    pub async fn register(&self, id: DeploymentId) -> oneshot::Receiver<PlanReview> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Delivers a decision. Returns false if no plan of `id` is waiting.
    pub async fn resolve(&self, id: &DeploymentId, review: PlanReview) -> bool {
        let Some(tx) = self.pending.lock().await.remove(id) else {
            return false;
        };
        info!(deployment = %id, user = review.user(), ?review, "plan reviewed");
        tx.send(review).is_ok()
    }

    pub async fn is_pending(&self, id: &DeploymentId) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    /// Waits for a decision on `id`. Returns `None` if cancelled first.
    pub async fn wait(&self, id: &DeploymentId, cancel: &CancellationToken) -> Option<PlanReview> {
        let rx = self.register(id.clone()).await;
        debug!(deployment = %id, "waiting for plan review");
        let review = tokio::select! {
            review = rx => review.ok(),
            _ = cancel.cancelled() => None,
        };
        if review.is_none() {
            self.pending.lock().await.remove(id);
        }
        review
    }
}
