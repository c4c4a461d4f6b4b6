//! Long-lived owner of one worker: one deploy root, or one pull request.
//!
//! The runner multiplexes its inputs in a single `select!` loop:
//!
//! - signals (new revision, unlock, pull request close)
//! - an inactivity deadline, re-armed on every signal
//! - a periodic queue-status refresh (deploy runners)
//! - a shutdown poll after a pull request closed
//!
//! It never exits on inactivity while the worker still has work: the deadline
//! is simply re-armed until the worker is idle.
//!
//! Before a voluntary exit the signal channel is closed, so the dispatcher
//! starts a fresh runner for anything sent afterwards. Signals that were
//! already buffered are still processed; the runner then exits as soon as the
//! worker is idle again. A runner started while its predecessor drains waits
//! for the predecessor to finish.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::message::{NewRevisionSignal, RunnerSignal, WorkerMessage};
use super::processor::RevisionProcessor;
use super::queue::QueueNotifier;
use super::worker::{Worker, WorkerState, WorkerStatus};
use crate::types::{Commit, DeploymentId, DeploymentInfo, Repo};

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_QUEUE_STATUS_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerMode {
    Deploy,
    PullRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub inactivity_timeout: Duration,
    pub queue_status_interval: Duration,
    pub shutdown_poll_interval: Duration,
    pub channel_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            queue_status_interval: DEFAULT_QUEUE_STATUS_INTERVAL,
            shutdown_poll_interval: DEFAULT_SHUTDOWN_POLL_INTERVAL,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

/// What one iteration of the runner loop reacted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerAction {
    OnCancel,
    OnTimeout,
    OnReceive,
    OnNotify,
    OnShutdownPoll,
    OnShutdown,
    /// The signal channel closed.
    OnUnknown,
}

impl fmt::Display for RunnerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerAction::OnCancel => "on_cancel",
            RunnerAction::OnTimeout => "on_timeout",
            RunnerAction::OnReceive => "on_receive",
            RunnerAction::OnNotify => "on_notify",
            RunnerAction::OnShutdownPoll => "on_shutdown_poll",
            RunnerAction::OnShutdown => "on_shutdown",
            RunnerAction::OnUnknown => "on_unknown",
        };
        write!(f, "{}", s)
    }
}

/// One deployment per root of a new-revision signal, each with a fresh ID.
pub fn deployments_for(repo: &Repo, signal: NewRevisionSignal) -> Vec<DeploymentInfo> {
    let NewRevisionSignal {
        revision,
        branch,
        roots,
        initiating_user,
        tags,
    } = signal;
    roots
        .into_iter()
        .map(|root| DeploymentInfo {
            id: DeploymentId::generate(),
            commit: Commit {
                revision: revision.clone(),
                branch: branch.clone(),
            },
            initiating_user: initiating_user.clone(),
            root,
            repo: repo.clone(),
            tags: tags.clone(),
            check_run_id: None,
        })
        .collect()
}

pub struct Runner {
    mode: RunnerMode,
    repo: Repo,
    config: RunnerConfig,
    signals: mpsc::Receiver<RunnerSignal>,
    cancel: CancellationToken,
    predecessor: Option<JoinHandle<RunnerAction>>,
}

impl Runner {
    pub fn new(
        mode: RunnerMode,
        repo: Repo,
        config: RunnerConfig,
        signals: mpsc::Receiver<RunnerSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Runner {
            mode,
            repo,
            config,
            signals,
            cancel,
            predecessor: None,
        }
    }

    /// Waits for `predecessor` to exit before handling any signal.
    pub fn after(mut self, predecessor: Option<JoinHandle<RunnerAction>>) -> Self {
        self.predecessor = predecessor;
        self
    }

    /// Runs until cancelled, idle past the inactivity timeout, shut down, or
    /// orphaned. Returns the action that ended the loop.
    #[instrument(skip_all, fields(repo = %self.repo, mode = ?self.mode))]
    pub async fn run<P, N>(mut self, processor: P, notifier: N) -> RunnerAction
    where
        P: RevisionProcessor + Send + Sync + 'static,
        N: QueueNotifier + Send + Sync + 'static,
    {
        if let Some(previous) = self.predecessor.take() {
            debug!("waiting for the previous runner to drain");
            tokio::select! {
                _ = self.cancel.cancelled() => return RunnerAction::OnCancel,
                _ = previous => {}
            }
        }

        let (worker, status) = Worker::new(processor, notifier);
        let (messages_tx, messages_rx) = mpsc::channel(self.config.channel_buffer);
        let (unlocks_tx, unlocks_rx) = mpsc::channel(self.config.channel_buffer);
        let worker_cancel = self.cancel.child_token();
        let worker_task = tokio::spawn(worker.run(messages_rx, unlocks_rx, worker_cancel.clone()));
        info!("runner started");

        let mut forwarded: u64 = 0;
        let mut deadline = Instant::now() + self.config.inactivity_timeout;
        let mut notify = interval_at(
            Instant::now() + self.config.queue_status_interval,
            self.config.queue_status_interval,
        );
        notify.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_poll = interval_at(
            Instant::now() + self.config.shutdown_poll_interval,
            self.config.shutdown_poll_interval,
        );
        let mut shutting_down = false;
        // Set once the channel is closed but late signals are still being worked.
        let mut draining: Option<RunnerAction> = None;
        let notify_enabled = self.mode == RunnerMode::Deploy;

        let exit = loop {
            let (action, signal) = tokio::select! {
                _ = self.cancel.cancelled() => (RunnerAction::OnCancel, None),
                signal = self.signals.recv(), if !shutting_down && draining.is_none() => match signal {
                    Some(RunnerSignal::Close) => (RunnerAction::OnShutdown, None),
                    Some(signal) => (RunnerAction::OnReceive, Some(signal)),
                    None => (RunnerAction::OnUnknown, None),
                },
                _ = sleep_until(deadline) => (RunnerAction::OnTimeout, None),
                _ = notify.tick(), if notify_enabled => (RunnerAction::OnNotify, None),
                _ = shutdown_poll.tick(), if shutting_down || draining.is_some() => {
                    (RunnerAction::OnShutdownPoll, None)
                }
            };
            debug!(%action, "runner woke");

            match action {
                RunnerAction::OnCancel | RunnerAction::OnUnknown => break action,
                RunnerAction::OnReceive => {
                    deadline = Instant::now() + self.config.inactivity_timeout;
                    let Some(signal) = signal else { continue };
                    forwarded += self
                        .forward(signal, &messages_tx, &unlocks_tx)
                        .await;
                }
                RunnerAction::OnTimeout => {
                    if draining.is_none() && self.is_idle(&status, forwarded) {
                        match self.close_and_forward_late(&messages_tx, &unlocks_tx).await {
                            None => break action,
                            Some(sent) => {
                                forwarded += sent;
                                draining = Some(action);
                                shutdown_poll.reset();
                            }
                        }
                        continue;
                    }
                    debug!("inactivity timeout with work outstanding, re-arming");
                    deadline = Instant::now() + self.config.inactivity_timeout;
                }
                RunnerAction::OnNotify => {
                    if messages_tx.send(WorkerMessage::NotifyQueueStatus).await.is_ok() {
                        forwarded += 1;
                    }
                }
                RunnerAction::OnShutdown => {
                    if self.mode == RunnerMode::PullRequest {
                        info!("pull request closed, shutting down once idle");
                        shutting_down = true;
                        shutdown_poll.reset();
                    } else {
                        warn!("close signal ignored by deploy runner");
                    }
                }
                RunnerAction::OnShutdownPoll => {
                    if let Some(exit) = draining {
                        if self.is_idle(&status, forwarded) {
                            break exit;
                        }
                        continue;
                    }
                    if status.borrow().state == WorkerState::Working {
                        continue;
                    }
                    match self.close_and_forward_late(&messages_tx, &unlocks_tx).await {
                        None => break action,
                        Some(sent) => {
                            forwarded += sent;
                            draining = Some(action);
                        }
                    }
                }
            }
        };

        self.signals.close();
        worker_cancel.cancel();
        if let Err(e) = worker_task.await {
            error!(error = %e, "worker task failed");
        }
        info!(exit = %exit, forwarded, "runner stopped");
        exit
    }

    /// Stops accepting signals and forwards whatever was already buffered.
    ///
    /// Returns `None` when nothing was buffered and the runner may exit,
    /// otherwise the number of worker messages sent.
    async fn close_and_forward_late(
        &mut self,
        messages: &mpsc::Sender<WorkerMessage>,
        unlocks: &mpsc::Sender<super::message::UnlockSignal>,
    ) -> Option<u64> {
        self.signals.close();
        let mut late = Vec::new();
        while let Ok(signal) = self.signals.try_recv() {
            late.push(signal);
        }
        if late.is_empty() {
            return None;
        }
        info!(signals = late.len(), "signals arrived while going idle, working them off first");
        let mut sent = 0;
        for signal in late {
            sent += self.forward(signal, messages, unlocks).await;
        }
        Some(sent)
    }

    /// Forwards one signal to the worker; returns the number of worker
    /// messages sent.
    async fn forward(
        &self,
        signal: RunnerSignal,
        messages: &mpsc::Sender<WorkerMessage>,
        unlocks: &mpsc::Sender<super::message::UnlockSignal>,
    ) -> u64 {
        match signal {
            RunnerSignal::NewRevision(signal) => {
                let mut sent = 0;
                for info in deployments_for(&self.repo, signal) {
                    debug!(deployment = %info.id, root = %info.root.name, "forwarding revision");
                    if messages.send(WorkerMessage::Revision(info)).await.is_err() {
                        warn!("worker is gone, dropping revision");
                        break;
                    }
                    sent += 1;
                }
                sent
            }
            RunnerSignal::Unlock(signal) => {
                if self.mode == RunnerMode::PullRequest {
                    debug!("unlock ignored by pull request runner");
                } else if unlocks.send(signal).await.is_err() {
                    warn!("worker is gone, dropping unlock");
                }
                0
            }
            RunnerSignal::Close => 0,
        }
    }

    fn is_idle(&self, status: &watch::Receiver<WorkerStatus>, forwarded: u64) -> bool {
        let status = status.borrow();
        self.signals.is_empty()
            && status.state != WorkerState::Working
            && status.queue_len == 0
            && status.messages_handled == forwarded
    }
}
