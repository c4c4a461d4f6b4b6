//! Shared fakes and fixtures for unit tests.
//!
//! Every fake is cheaply cloneable; clones share their recorded state, so a
//! test can hand one clone to the code under test and inspect another.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::effects::{
    CheckRunData, CheckRunState, CommitDirection, GitHubEffect, GitHubInterpreter, GitHubResponse,
    PullRequestData,
};
use crate::github::GitHubApiError;
use crate::notifier::{Notifier, NotifierError};
use crate::persistence::{DeploymentStore, StoreError};
use crate::retry::RetryConfig;
use crate::terraform::{
    ApplicationError, Checkout, CheckoutError, ExecError, Executor, TerraformCommand, TerraformRequest, TerraformResponse,
    TerraformWorkflow,
};
use crate::types::{
    CheckRunId, Commit, DeploymentId, DeploymentInfo, DeploymentRecord, PrNumber, Repo, RepoId,
    Root, Sha, Trigger, TriggerInfo, WorkflowState,
};
use crate::worker::post_deploy::{PostDeployError, PostDeployExecutor};
use crate::worker::queue::{LockState, QueueNotifier};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

pub fn root(name: &str) -> Root {
    Root {
        name: name.into(),
        path: format!("live/{}", name),
        tracked_files: vec![],
        trigger_info: TriggerInfo::merge(),
    }
}

/// A deployment of root `network` in `acme/infra` at `revision`.
pub fn deployment(revision: &str, trigger: Trigger) -> DeploymentInfo {
    let mut root = root("network");
    root.trigger_info = TriggerInfo {
        trigger,
        rerun: false,
    };
    DeploymentInfo {
        id: DeploymentId::generate(),
        commit: Commit {
            revision: Sha::new(revision),
            branch: "main".into(),
        },
        initiating_user: "alice".into(),
        root,
        repo: Repo::new("acme", "infra", "main"),
        tags: BTreeMap::new(),
        check_run_id: None,
    }
}

// ─── GitHub ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeGitHubState {
    effects: Vec<GitHubEffect>,
    last_retry: Option<RetryConfig>,
    next_check_run_id: u64,
    fail_next: usize,
    directions: HashMap<(String, String), CommitDirection>,
    open_prs: Vec<PullRequestData>,
    modified_files: HashMap<PrNumber, Vec<String>>,
    failing_prs: HashSet<PrNumber>,
}

/// An in-memory [`GitHubInterpreter`] that records every effect.
///
/// Unknown comparisons report `Ahead`.
#[derive(Clone, Default)]
pub struct FakeGitHub {
    state: Arc<Mutex<FakeGitHubState>>,
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` effects with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    pub fn set_direction(&self, base: &str, head: &str, direction: CommitDirection) {
        self.state
            .lock()
            .unwrap()
            .directions
            .insert((base.into(), head.into()), direction);
    }

    pub fn add_open_pr(&self, number: u64, head_sha: &str, base_ref: &str, files: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.open_prs.push(PullRequestData {
            number: PrNumber(number),
            head_sha: Sha::new(head_sha),
            base_ref: base_ref.into(),
        });
        state
            .modified_files
            .insert(PrNumber(number), files.iter().map(|f| f.to_string()).collect());
    }

    /// Makes every effect that targets `pr` fail.
    pub fn fail_pr(&self, number: u64) {
        self.state.lock().unwrap().failing_prs.insert(PrNumber(number));
    }

    pub fn effects(&self) -> Vec<GitHubEffect> {
        self.state.lock().unwrap().effects.clone()
    }

    pub fn last_retry(&self) -> Option<RetryConfig> {
        self.state.lock().unwrap().last_retry
    }

    fn count(&self, pred: impl Fn(&GitHubEffect) -> bool) -> usize {
        self.state.lock().unwrap().effects.iter().filter(|e| pred(e)).count()
    }

    pub fn create_calls(&self) -> usize {
        self.count(|e| matches!(e, GitHubEffect::CreateCheckRun { .. }))
    }

    pub fn update_calls(&self) -> usize {
        self.count(|e| matches!(e, GitHubEffect::UpdateCheckRun { .. }))
    }

    pub fn compare_calls(&self) -> usize {
        self.count(|e| matches!(e, GitHubEffect::CompareCommits { .. }))
    }

    fn last_check_run(&self) -> Option<(CheckRunState, String)> {
        self.state
            .lock()
            .unwrap()
            .effects
            .iter()
            .rev()
            .find_map(|e| match e {
                GitHubEffect::CreateCheckRun { state, summary, .. }
                | GitHubEffect::UpdateCheckRun { state, summary, .. } => {
                    Some((*state, summary.clone()))
                }
                _ => None,
            })
    }

    pub fn last_check_run_state(&self) -> Option<CheckRunState> {
        self.last_check_run().map(|(state, _)| state)
    }

    pub fn last_summary(&self) -> Option<String> {
        self.last_check_run().map(|(_, summary)| summary)
    }

    /// `(pr, revision)` of every successful minimum-revision update.
    pub fn revisions_set(&self) -> Vec<(PrNumber, Sha)> {
        self.state
            .lock()
            .unwrap()
            .effects
            .iter()
            .filter_map(|e| match e {
                GitHubEffect::SetPrRevision { pr, revision, .. } => Some((*pr, revision.clone())),
                _ => None,
            })
            .collect()
    }
}

impl GitHubInterpreter for FakeGitHub {
    type Error = GitHubApiError;

    async fn interpret_with_retry(
        &self,
        effect: GitHubEffect,
        retry: RetryConfig,
    ) -> Result<GitHubResponse, Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.last_retry = Some(retry);

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(GitHubApiError::transient_without_source("injected failure"));
        }
        let targets_failing_pr = match &effect {
            GitHubEffect::ListModifiedFiles { pr } | GitHubEffect::SetPrRevision { pr, .. } => {
                state.failing_prs.contains(pr)
            }
            _ => false,
        };
        if targets_failing_pr {
            return Err(GitHubApiError::permanent_without_source("injected PR failure"));
        }

        state.effects.push(effect.clone());
        let response = match effect {
            GitHubEffect::CreateCheckRun { state: run, .. } => {
                state.next_check_run_id += 1;
                GitHubResponse::CheckRun(CheckRunData {
                    id: CheckRunId(state.next_check_run_id),
                    status: run.as_api_status().0.to_string(),
                })
            }
            GitHubEffect::UpdateCheckRun { id, state: run, .. } => {
                GitHubResponse::CheckRun(CheckRunData {
                    id,
                    status: run.as_api_status().0.to_string(),
                })
            }
            GitHubEffect::CompareCommits { base, head } => GitHubResponse::Comparison(
                state
                    .directions
                    .get(&(base.0, head.0))
                    .copied()
                    .unwrap_or(CommitDirection::Ahead),
            ),
            GitHubEffect::ListOpenPrs { base } => GitHubResponse::PrList(
                state
                    .open_prs
                    .iter()
                    .filter(|pr| pr.base_ref == base)
                    .cloned()
                    .collect(),
            ),
            GitHubEffect::ListModifiedFiles { pr } => GitHubResponse::ModifiedFiles(
                state.modified_files.get(&pr).cloned().unwrap_or_default(),
            ),
            GitHubEffect::SetPrRevision { .. } => GitHubResponse::Ok,
        };
        Ok(response)
    }
}

// ─── Storage ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct InMemoryStoreState {
    records: HashMap<(RepoId, String), DeploymentRecord>,
    latest: Option<DeploymentRecord>,
    fetches: usize,
    stores: usize,
    failing_writes: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record without counting it as a write.
    pub fn seed(&self, record: DeploymentRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .records
            .insert((record.repo.clone(), record.root.name.clone()), record.clone());
        state.latest = Some(record);
    }

    /// Makes every later write fail with an IO error.
    pub fn fail_writes(&self) {
        self.state.lock().unwrap().failing_writes = true;
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn store_count(&self) -> usize {
        self.state.lock().unwrap().stores
    }

    /// The most recently written record.
    pub fn latest(&self) -> Option<DeploymentRecord> {
        self.state.lock().unwrap().latest.clone()
    }
}

impl DeploymentStore for InMemoryStore {
    async fn fetch_latest(
        &self,
        repo: &RepoId,
        root: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        Ok(state.records.get(&(repo.clone(), root.to_string())).cloned())
    }

    async fn store_latest(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.stores += 1;
        if state.failing_writes {
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        state
            .records
            .insert((record.repo.clone(), record.root.name.clone()), record.clone());
        state.latest = Some(record.clone());
        Ok(())
    }
}

// ─── Terraform ────────────────────────────────────────────────────────────────

type Script = (Vec<WorkflowState>, Result<TerraformResponse, ApplicationError>);

#[derive(Default)]
struct FakeTerraformState {
    scripts: std::collections::VecDeque<Script>,
    requests: Vec<TerraformRequest>,
}

/// A [`TerraformWorkflow`] that replays scripted runs in order.
///
/// Unscripted runs publish nothing and succeed. A gated fake holds every run
/// until a permit is added to its gate, or the run is cancelled.
#[derive(Clone, Default)]
pub struct FakeTerraform {
    state: Arc<Mutex<FakeTerraformState>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeTerraform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fake = FakeTerraform {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (fake, gate)
    }

    pub fn script(
        &self,
        states: Vec<WorkflowState>,
        result: Result<TerraformResponse, ApplicationError>,
    ) {
        self.state.lock().unwrap().scripts.push_back((states, result));
    }

    pub fn requests(&self) -> Vec<TerraformRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl TerraformWorkflow for FakeTerraform {
    async fn run(
        &self,
        request: TerraformRequest,
        states: mpsc::UnboundedSender<WorkflowState>,
    ) -> Result<TerraformResponse, ApplicationError> {
        let cancel = request.cancel.clone();
        self.state.lock().unwrap().requests.push(request);

        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(ApplicationError::new("CanceledError", "cancelled"));
                }
            }
        }

        let script = self.state.lock().unwrap().scripts.pop_front();
        let (scripted_states, result) = script.unwrap_or_else(|| (vec![], Ok(TerraformResponse::default())));
        for state in scripted_states {
            let _ = states.send(state);
        }
        result
    }
}

/// An [`Executor`] that records commands instead of running them.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    fail_on: Option<TerraformCommand>,
    calls: Arc<Mutex<Vec<(TerraformCommand, std::path::PathBuf)>>>,
}

impl ScriptedExecutor {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing_on(command: TerraformCommand) -> Self {
        ScriptedExecutor {
            fail_on: Some(command),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<TerraformCommand> {
        self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    pub fn workdirs(&self) -> Vec<std::path::PathBuf> {
        self.calls.lock().unwrap().iter().map(|(_, w)| w.clone()).collect()
    }
}

impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        command: TerraformCommand,
        workdir: &std::path::Path,
        _cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((command, workdir.to_path_buf()));
        if self.fail_on == Some(command) {
            return Err(ExecError::Failed {
                command: command.name(),
                status: "exit status: 1".into(),
                stderr: "Error: scripted failure".into(),
            });
        }
        Ok(format!("{} ok", command.name()))
    }
}

/// Hands out `<root>/<deployment id>/<root path>` without touching git.
#[derive(Clone)]
pub struct FakeCheckout {
    root: std::path::PathBuf,
    prepared: Arc<Mutex<Vec<Sha>>>,
    released: Arc<Mutex<Vec<DeploymentId>>>,
}

impl FakeCheckout {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        FakeCheckout {
            root: root.into(),
            prepared: Arc::default(),
            released: Arc::default(),
        }
    }

    /// Revisions checked out, in order.
    pub fn prepared(&self) -> Vec<Sha> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<DeploymentId> {
        self.released.lock().unwrap().clone()
    }
}

impl Checkout for FakeCheckout {
    async fn prepare(
        &self,
        info: &DeploymentInfo,
        _cancel: &CancellationToken,
    ) -> Result<std::path::PathBuf, CheckoutError> {
        let path = info.root.relative_path()?;
        self.prepared.lock().unwrap().push(info.revision().clone());
        Ok(self.root.join(info.id.as_str()).join(path))
    }

    async fn release(&self, info: &DeploymentInfo) {
        self.released.lock().unwrap().push(info.id.clone());
    }
}

// ─── Notifiers ────────────────────────────────────────────────────────────────

pub type NotifyLog = Arc<Mutex<Vec<&'static str>>>;

#[derive(Clone)]
pub struct RecordingNotifier {
    name: &'static str,
    fail: bool,
    calls: Arc<AtomicU64>,
    log: NotifyLog,
}

impl RecordingNotifier {
    pub fn new(name: &'static str) -> Self {
        Self::with_log(name, Self::shared_log())
    }

    pub fn failing(name: &'static str) -> Self {
        RecordingNotifier {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn shared_log() -> NotifyLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn with_log(name: &'static str, log: NotifyLog) -> Self {
        RecordingNotifier {
            name,
            fail: false,
            calls: Arc::new(AtomicU64::new(0)),
            log,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn notify(&self, _info: &DeploymentInfo, _state: &WorkflowState) -> Result<(), NotifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(self.name);
        if self.fail {
            return Err(NotifierError::CheckRun(crate::notifier::CheckRunError::GitHub(
                "injected".into(),
            )));
        }
        Ok(())
    }
}

/// Records queue hooks. `updates` holds each refresh as
/// `(lock, revisions in order)`.
#[derive(Clone, Default)]
pub struct RecordingQueueNotifier {
    queued: Arc<Mutex<Vec<(DeploymentId, usize)>>>,
    updates: Arc<Mutex<Vec<(LockState, Vec<String>)>>>,
}

impl RecordingQueueNotifier {
    pub fn queued(&self) -> Vec<(DeploymentId, usize)> {
        self.queued.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(LockState, Vec<String>)> {
        self.updates.lock().unwrap().clone()
    }
}

impl QueueNotifier for RecordingQueueNotifier {
    async fn on_revision_queued(
        &self,
        info: &DeploymentInfo,
        position: usize,
        _lock: &LockState,
    ) -> Option<CheckRunId> {
        self.queued.lock().unwrap().push((info.id.clone(), position));
        None
    }

    async fn update_queued_revisions(&self, lock: &LockState, items: &[DeploymentInfo]) {
        let revisions = items
            .iter()
            .map(|i| i.commit.revision.to_string())
            .collect();
        self.updates.lock().unwrap().push((lock.clone(), revisions));
    }
}

// ─── Post-deploy ──────────────────────────────────────────────────────────────

pub struct FailingPostDeploy;

#[async_trait]
impl PostDeployExecutor for FailingPostDeploy {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn execute(&self, _info: &DeploymentInfo) -> Result<(), PostDeployError> {
        Err(PostDeployError {
            executor: self.name(),
            message: "always fails".into(),
        })
    }
}
