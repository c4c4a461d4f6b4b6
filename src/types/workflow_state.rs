//! Progress snapshots emitted by a Terraform execution unit.
//!
//! A `WorkflowState` is a full snapshot, not a delta: every update carries the
//! state of all jobs seen so far, so a receiver only ever needs the latest one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Blocked on a human (e.g. plan confirmation).
    Waiting,
    InProgress,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// An action a human can take on a waiting job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAction {
    /// Stable identifier echoed back when the action is taken.
    pub id: String,
    /// Short label shown to the user.
    pub info: String,
}

impl JobAction {
    pub const CONFIRM: &'static str = "confirm";
    pub const REJECT: &'static str = "reject";

    pub fn confirm() -> Self {
        JobAction {
            id: Self::CONFIRM.into(),
            info: "Confirm".into(),
        }
    }

    pub fn reject() -> Self {
        JobAction {
            id: Self::REJECT.into(),
            info: "Reject".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Command output (or a link to it).
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub on_waiting_actions: Vec<JobAction>,
}

impl Job {
    pub fn started(now: DateTime<Utc>) -> Self {
        Job {
            status: JobStatus::InProgress,
            start_time: Some(now),
            end_time: None,
            output: None,
            on_waiting_actions: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>, output: Option<String>) {
        self.status = status;
        self.end_time = Some(now);
        self.output = output;
        self.on_waiting_actions.clear();
    }

    pub fn wait_for(&mut self, actions: Vec<JobAction>) {
        self.status = JobStatus::Waiting;
        self.on_waiting_actions = actions;
    }

    /// True when the job is blocked on a human and offers something to click.
    pub fn needs_action(&self) -> bool {
        self.status == JobStatus::Waiting && !self.on_waiting_actions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    #[default]
    Unknown,
    SuccessfulCompletion,
    SkippedCompletion,
    InternalServiceError,
    PlanRejected,
    TimeoutError,
    ActivityDurationTimeoutError,
    HeartbeatTimeoutError,
    SchedulingTimeoutError,
}

impl CompletionReason {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CompletionReason::TimeoutError
                | CompletionReason::ActivityDurationTimeoutError
                | CompletionReason::HeartbeatTimeoutError
                | CompletionReason::SchedulingTimeoutError
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    pub reason: CompletionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    #[default]
    Deploy,
    /// Plan-only runs for an open pull request.
    PullRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    pub plan: Option<Job>,
    pub validate: Option<Job>,
    pub apply: Option<Job>,
    pub result: WorkflowResult,
    pub mode: WorkflowMode,
}

impl WorkflowState {
    pub fn new(mode: WorkflowMode) -> Self {
        WorkflowState {
            mode,
            ..Default::default()
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        [&self.plan, &self.validate, &self.apply]
            .into_iter()
            .flatten()
    }

    pub fn is_complete(&self) -> bool {
        self.result.status == WorkflowStatus::Complete
    }

    pub fn complete(&mut self, reason: CompletionReason) {
        self.result = WorkflowResult {
            status: WorkflowStatus::Complete,
            reason,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finishing_a_job_clears_actions() {
        let mut job = Job::started(Utc::now());
        job.wait_for(vec![JobAction::confirm(), JobAction::reject()]);
        assert!(job.needs_action());

        job.finish(JobStatus::Success, Utc::now(), Some("ok".into()));
        assert!(!job.needs_action());
        assert!(job.end_time.is_some());
        assert_eq!(job.output.as_deref(), Some("ok"));
    }

    #[test]
    fn waiting_without_actions_does_not_need_action() {
        let mut job = Job::started(Utc::now());
        job.wait_for(vec![]);
        assert!(!job.needs_action());
    }

    #[test]
    fn jobs_iterates_present_jobs_in_order() {
        let mut state = WorkflowState::new(WorkflowMode::Deploy);
        assert_eq!(state.jobs().count(), 0);

        state.plan = Some(Job::started(Utc::now()));
        state.apply = Some(Job::started(Utc::now()));
        assert_eq!(state.jobs().count(), 2);
    }

    #[test]
    fn timeout_reasons() {
        assert!(CompletionReason::HeartbeatTimeoutError.is_timeout());
        assert!(CompletionReason::SchedulingTimeoutError.is_timeout());
        assert!(!CompletionReason::InternalServiceError.is_timeout());
        assert!(!CompletionReason::PlanRejected.is_timeout());
    }
}
