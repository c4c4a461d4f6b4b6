//! Revision queue for one runner.
//!
//! Items are ordered by trigger class (manual first), then by arrival (FIFO
//! within a class). Merge-triggered items can additionally be held back by a
//! lock: after a manual deploy of a revision that diverged from the deployed
//! baseline, merged revisions must not silently overwrite it until a human
//! unlocks the queue.
//!
//! # Eligibility
//!
//! - Manual items are always eligible.
//! - Merge items are eligible only while the queue is unlocked.

use std::collections::{HashSet, VecDeque};
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{CheckRunId, DeploymentId, DeploymentInfo, Sha, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    #[default]
    Unlocked,
    Locked,
}

/// Whether merged revisions may be deployed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockState {
    pub status: LockStatus,
    /// The revision whose deploy caused the lock.
    pub revision: Option<Sha>,
}

impl LockState {
    pub fn unlocked() -> Self {
        LockState::default()
    }

    pub fn locked(revision: Sha) -> Self {
        LockState {
            status: LockStatus::Locked,
            revision: Some(revision),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status == LockStatus::Locked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("no eligible revision in queue")]
    Empty,
}

/// Hooks through which the queue's state is made visible to users.
pub trait QueueNotifier {
    /// Called before a revision enters the queue at `position` (the number of
    /// items that will be ahead of it). Returns the check run that tracks the
    /// revision from now on, if one was created.
    fn on_revision_queued(
        &self,
        info: &DeploymentInfo,
        position: usize,
        lock: &LockState,
    ) -> impl Future<Output = Option<CheckRunId>> + Send;

    /// Called on every lock transition (and on periodic refreshes) with the
    /// merge-triggered items still waiting, in queue order.
    fn update_queued_revisions(
        &self,
        lock: &LockState,
        items: &[DeploymentInfo],
    ) -> impl Future<Output = ()> + Send;
}

/// A [`QueueNotifier`] that publishes nothing (pull request plan queues).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueueNotifier;

impl QueueNotifier for NoopQueueNotifier {
    async fn on_revision_queued(
        &self,
        _info: &DeploymentInfo,
        _position: usize,
        _lock: &LockState,
    ) -> Option<CheckRunId> {
        None
    }

    async fn update_queued_revisions(&self, _lock: &LockState, _items: &[DeploymentInfo]) {}
}

/// The revision queue of one runner.
///
/// Owned by a single worker task; it is never shared.
pub struct DeploymentQueue<N> {
    manual: VecDeque<DeploymentInfo>,
    merge: VecDeque<DeploymentInfo>,
    /// IDs currently in the queue, to reject duplicate deliveries.
    queued_ids: HashSet<DeploymentId>,
    lock: LockState,
    notifier: N,
}

impl<N> DeploymentQueue<N> {
    pub fn new(notifier: N) -> Self {
        DeploymentQueue {
            manual: VecDeque::new(),
            merge: VecDeque::new(),
            queued_ids: HashSet::new(),
            lock: LockState::unlocked(),
            notifier,
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn len(&self) -> usize {
        self.manual.len() + self.merge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manual.is_empty() && self.merge.is_empty()
    }

    pub fn lock_state(&self) -> &LockState {
        &self.lock
    }

    /// Adds a revision to the queue.
    ///
    /// Manual items go ahead of every merge item, behind earlier manual items.
    /// Returns false (and leaves the queue unchanged) if an item with the same
    /// deployment ID is already queued.
    pub fn push(&mut self, info: DeploymentInfo) -> bool {
        if !self.queued_ids.insert(info.id.clone()) {
            debug!(deployment = %info.id, "duplicate deployment, skipping");
            return false;
        }
        match info.trigger() {
            Trigger::Manual => self.manual.push_back(info),
            Trigger::Merge => self.merge.push_back(info),
        }
        true
    }

    pub fn contains(&self, id: &DeploymentId) -> bool {
        self.queued_ids.contains(id)
    }

    /// How many items would be ahead of a newly pushed item with `trigger`.
    pub fn position_for(&self, trigger: Trigger) -> usize {
        match trigger {
            Trigger::Manual => self.manual.len(),
            Trigger::Merge => self.len(),
        }
    }

    /// The front-most item regardless of eligibility.
    pub fn peek(&self) -> Option<&DeploymentInfo> {
        self.manual.front().or_else(|| self.merge.front())
    }

    /// True if the queue is non-empty and its front item may be processed now.
    pub fn can_pop(&self) -> bool {
        match self.peek() {
            Some(front) => !self.lock.is_locked() || front.is_manual(),
            None => false,
        }
    }

    /// Removes and returns the front-most eligible item.
    pub fn pop(&mut self) -> Result<DeploymentInfo, QueueError> {
        let item = if let Some(item) = self.manual.pop_front() {
            item
        } else if !self.lock.is_locked()
            && let Some(item) = self.merge.pop_front()
        {
            item
        } else {
            return Err(QueueError::Empty);
        };
        self.queued_ids.remove(&item.id);
        Ok(item)
    }

    /// Merge-triggered items still waiting, in queue order.
    pub fn ordered_merged_items(&self) -> Vec<DeploymentInfo> {
        self.merge.iter().cloned().collect()
    }
}

impl<N: QueueNotifier> DeploymentQueue<N> {
    /// Changes whether merge-triggered items may be popped.
    ///
    /// On a transition, the notifier is told about every waiting merge item
    /// before this returns; setting the current state again does nothing.
    pub async fn set_lock_for_merged_items(&mut self, lock: LockState) {
        if self.lock == lock {
            return;
        }
        info!(
            status = ?lock.status,
            revision = lock.revision.as_ref().map(|r| r.as_str()),
            waiting = self.merge.len(),
            "merge lock changed"
        );
        self.lock = lock;
        self.refresh_queued_revisions().await;
    }

    /// Re-publishes the state of every waiting merge item.
    pub async fn refresh_queued_revisions(&self) {
        let items = self.ordered_merged_items();
        self.notifier
            .update_queued_revisions(&self.lock, &items)
            .await;
    }
}
