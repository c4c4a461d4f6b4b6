//! Check runs for revisions waiting in a deploy queue.

use std::fmt::Display;
use std::sync::Arc;

use tracing::warn;

use super::check_run::{CheckRunCache, CheckRunRequest};
use super::format::render_queued_summary;
use crate::effects::{CheckRunAction, CheckRunState, GitHubInterpreter};
use crate::types::{CheckRunId, DeploymentInfo};
use crate::worker::queue::{LockState, QueueNotifier};

/// Publishes queue position and lock state through the deploy check run.
///
/// Shares its cache with the deployer, so the check run created when a
/// revision is queued is the one later updated with plan and apply progress.
pub struct CheckRunQueueNotifier<G> {
    cache: Arc<CheckRunCache<G>>,
}

impl<G> CheckRunQueueNotifier<G> {
    pub fn new(cache: Arc<CheckRunCache<G>>) -> Self {
        CheckRunQueueNotifier { cache }
    }
}

fn waiting_request(info: &DeploymentInfo, position: usize, lock: &LockState) -> CheckRunRequest {
    let is_merge = !info.is_manual();
    let summary = render_queued_summary(position, lock, is_merge);
    if is_merge && lock.is_locked() {
        CheckRunRequest::for_deployment(info, CheckRunState::ActionRequired, summary)
            .with_actions(vec![CheckRunAction::unlock()])
    } else {
        CheckRunRequest::for_deployment(info, CheckRunState::Queued, summary)
    }
}

impl<G> QueueNotifier for CheckRunQueueNotifier<G>
where
    G: GitHubInterpreter + Send + Sync,
    G::Error: Display + Send,
{
    async fn on_revision_queued(
        &self,
        info: &DeploymentInfo,
        position: usize,
        lock: &LockState,
    ) -> Option<CheckRunId> {
        let request = waiting_request(info, position, lock);
        match self.cache.create_or_update(&info.id, request).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(deployment = %info.id, error = %e, "failed to create queued check run");
                None
            }
        }
    }

    async fn update_queued_revisions(&self, lock: &LockState, items: &[DeploymentInfo]) {
        for (position, info) in items.iter().enumerate() {
            let request = waiting_request(info, position, lock);
            if let Err(e) = self.cache.create_or_update(&info.id, request).await {
                warn!(deployment = %info.id, error = %e, "failed to refresh queued check run");
            }
        }
    }
}
