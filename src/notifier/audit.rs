//! Audit records for apply jobs.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Notifier, NotifierError};
use crate::persistence::{AuditEvent, AuditJobState, AuditSink};
use crate::types::{DeploymentInfo, JobStatus, WorkflowState};

/// Writes one audit event per apply-job transition.
///
/// The same transition is reported by every later state update too (states
/// are snapshots), so each event key is written at most once. Once an apply
/// finished only its final key is kept, and only for the most recently
/// finished deployments.
pub struct AuditNotifier<A> {
    sink: A,
    written: Mutex<Written>,
    retain_finished: usize,
}

/// Finished deployments whose final key is still remembered.
pub const RETAIN_FINISHED: usize = 1024;

#[derive(Default)]
struct Written {
    keys: HashSet<String>,
    finished: VecDeque<String>,
}

impl<A> AuditNotifier<A> {
    pub fn new(sink: A) -> Self {
        AuditNotifier {
            sink,
            written: Mutex::new(Written::default()),
            retain_finished: RETAIN_FINISHED,
        }
    }
}

fn audit_state(status: JobStatus) -> Option<AuditJobState> {
    match status {
        JobStatus::InProgress => Some(AuditJobState::Started),
        JobStatus::Success => Some(AuditJobState::Succeeded),
        JobStatus::Failed => Some(AuditJobState::Failed),
        JobStatus::Waiting => None,
    }
}

#[async_trait]
impl<A> Notifier for AuditNotifier<A>
where
    A: AuditSink + Send + Sync,
{
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn notify(&self, info: &DeploymentInfo, state: &WorkflowState) -> Result<(), NotifierError> {
        let Some(apply) = &state.apply else {
            return Ok(());
        };
        let Some(job_state) = audit_state(apply.status) else {
            return Ok(());
        };

        let key = AuditEvent::content_key(&info.id, job_state);
        if self.written.lock().await.keys.contains(&key) {
            return Ok(());
        }

        let event = AuditEvent {
            key: key.clone(),
            repo: info.repo.id(),
            root: info.root.name.clone(),
            job_id: info.id.clone(),
            user: info.initiating_user.clone(),
            tags: info.tags.clone(),
            revision: info.commit.revision.clone(),
            state: job_state,
            start_time: apply.start_time,
            end_time: apply.end_time,
            is_force_apply: info.is_manual(),
        };
        self.sink.audit_job(event).await?;

        debug!(key = %key, "audited apply job");
        let mut written = self.written.lock().await;
        if job_state != AuditJobState::Started {
            written
                .keys
                .remove(&AuditEvent::content_key(&info.id, AuditJobState::Started));
            written.finished.push_back(key.clone());
            while written.finished.len() > self.retain_finished {
                if let Some(oldest) = written.finished.pop_front() {
                    written.keys.remove(&oldest);
                }
            }
        }
        written.keys.insert(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::JsonlAuditLog;
    use crate::test_utils::deployment;
    use crate::types::{Job, Trigger, WorkflowMode};
    use chrono::Utc;
    use tempfile::tempdir;

    fn state_with_apply(apply: Option<Job>) -> WorkflowState {
        let mut state = WorkflowState::new(WorkflowMode::Deploy);
        state.plan = Some(Job::started(Utc::now()));
        state.apply = apply;
        state
    }

    #[tokio::test]
    async fn each_transition_is_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apply.log");
        let notifier = AuditNotifier::new(JsonlAuditLog::open(&path).unwrap());
        let info = deployment("abc", Trigger::Manual);

        let mut apply = Job::started(Utc::now());
        let started = state_with_apply(Some(apply.clone()));
        notifier.notify(&info, &started).await.unwrap();
        notifier.notify(&info, &started).await.unwrap();

        apply.finish(JobStatus::Success, Utc::now(), None);
        let done = state_with_apply(Some(apply));
        notifier.notify(&info, &done).await.unwrap();
        notifier.notify(&info, &done).await.unwrap();

        let events = JsonlAuditLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].state, AuditJobState::Started);
        assert_eq!(events[1].state, AuditJobState::Succeeded);
        assert!(events[1].end_time.is_some());
        assert!(events.iter().all(|e| e.is_force_apply));
        assert_eq!(events[0].root, "network");
    }

    #[tokio::test]
    async fn finished_deployments_are_forgotten_oldest_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apply.log");
        let notifier = AuditNotifier {
            retain_finished: 1,
            ..AuditNotifier::new(JsonlAuditLog::open(&path).unwrap())
        };
        let first = deployment("abc", Trigger::Merge);
        let second = deployment("def", Trigger::Merge);

        for info in [&first, &second] {
            let mut apply = Job::started(Utc::now());
            notifier
                .notify(info, &state_with_apply(Some(apply.clone())))
                .await
                .unwrap();
            apply.finish(JobStatus::Failed, Utc::now(), Some("boom".into()));
            let done = state_with_apply(Some(apply));
            notifier.notify(info, &done).await.unwrap();
            notifier.notify(info, &done).await.unwrap();
        }

        let written = notifier.written.lock().await;
        assert_eq!(
            written.keys,
            HashSet::from([AuditEvent::content_key(&second.id, AuditJobState::Failed)])
        );
        assert_eq!(written.finished.len(), 1);
        assert_eq!(JsonlAuditLog::read_all(&path).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn states_without_apply_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apply.log");
        let notifier = AuditNotifier::new(JsonlAuditLog::open(&path).unwrap());
        let info = deployment("abc", Trigger::Merge);

        notifier.notify(&info, &state_with_apply(None)).await.unwrap();

        let mut waiting = Job::started(Utc::now());
        waiting.status = JobStatus::Waiting;
        notifier
            .notify(&info, &state_with_apply(Some(waiting)))
            .await
            .unwrap();

        assert!(JsonlAuditLog::read_all(&path).unwrap().is_empty());
    }
}
