//! The single consumer of a runner's revision queue.
//!
//! # Event Loop
//!
//! 1. If the queue can pop, take the front-most eligible revision and process
//!    it. Worker messages keep being received (and queued) while it runs.
//! 2. Otherwise wait for a worker message, an unlock, or cancellation.
//! 3. On cancellation, leave the loop and report `Complete`.
//!
//! The queue, its lock and the deployed baseline are owned by this task. The
//! runner only ever sees them through the published [`WorkerStatus`].
//!
//! Cancellation is not raced against processing: the processor observes the
//! token itself, so an in-flight Terraform run winds down (and its last state
//! updates are delivered) before the worker exits.

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::message::{UnlockSignal, WorkerMessage};
use super::processor::{ProcessError, RevisionProcessor};
use super::queue::{DeploymentQueue, LockState, QueueNotifier};
use crate::types::DeploymentRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Waiting,
    Working,
    /// The loop has exited. Terminal.
    Complete,
}

/// Snapshot of a worker, published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub queue_len: usize,
    /// Worker messages received so far.
    pub messages_handled: u64,
    pub lock: LockState,
}

pub struct Worker<P, N> {
    processor: P,
    queue: DeploymentQueue<N>,
    latest: Option<DeploymentRecord>,
    status: watch::Sender<WorkerStatus>,
    messages_handled: u64,
}

impl<P, N> Worker<P, N>
where
    P: RevisionProcessor,
    N: QueueNotifier,
{
    pub fn new(processor: P, notifier: N) -> (Self, watch::Receiver<WorkerStatus>) {
        let (status, rx) = watch::channel(WorkerStatus::default());
        let worker = Worker {
            processor,
            queue: DeploymentQueue::new(notifier),
            latest: None,
            status,
            messages_handled: 0,
        };
        (worker, rx)
    }

    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<WorkerMessage>,
        mut unlocks: mpsc::Receiver<UnlockSignal>,
        cancel: CancellationToken,
    ) {
        info!("worker started");
        let mut messages_open = true;
        let mut unlocks_open = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.queue.can_pop() {
                let Ok(item) = self.queue.pop() else {
                    continue;
                };
                self.publish(WorkerState::Working);
                info!(
                    deployment = %item.id,
                    revision = %item.commit.revision,
                    trigger = %item.trigger(),
                    "processing revision"
                );

                let result = {
                    let Worker {
                        processor,
                        queue,
                        latest,
                        status,
                        messages_handled,
                    } = &mut self;
                    let process = processor.process(&item, latest.clone(), &mut unlocks, &cancel);
                    tokio::pin!(process);

                    loop {
                        tokio::select! {
                            biased;

                            result = &mut process => break result,
                            msg = messages.recv(), if messages_open => match msg {
                                Some(msg) => {
                                    handle_message(queue, msg).await;
                                    *messages_handled += 1;
                                    publish(status, WorkerState::Working, queue, *messages_handled);
                                }
                                None => messages_open = false,
                            },
                        }
                    }
                };

                match result {
                    Ok(outcome) => {
                        if let Some(record) = outcome.record {
                            debug!(revision = %record.revision, "deployed baseline updated");
                            self.latest = Some(record);
                        }
                        if let Some(lock) = outcome.lock_merged_items {
                            self.queue.set_lock_for_merged_items(lock).await;
                        }
                    }
                    Err(e) => {
                        warn!(deployment = %item.id, error = %e, "revision not deployed");
                        // A failed apply may still have moved the stored baseline.
                        if matches!(e, ProcessError::Terraform(_)) && !e.is_plan_rejection() {
                            self.latest = None;
                        }
                    }
                }
                continue;
            }

            self.publish(WorkerState::Waiting);
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = messages.recv(), if messages_open => match msg {
                    Some(msg) => {
                        handle_message(&mut self.queue, msg).await;
                        self.messages_handled += 1;
                    }
                    None => {
                        debug!("worker message channel closed");
                        messages_open = false;
                    }
                },
                signal = unlocks.recv(), if unlocks_open => match signal {
                    Some(signal) => {
                        info!(user = %signal.user, "unlock received");
                        self.queue.set_lock_for_merged_items(LockState::unlocked()).await;
                    }
                    None => unlocks_open = false,
                },
            }
        }

        self.publish(WorkerState::Complete);
        info!(queued = self.queue.len(), "worker stopped");
    }

    fn publish(&self, state: WorkerState) {
        publish(&self.status, state, &self.queue, self.messages_handled);
    }
}

fn publish<N>(
    status: &watch::Sender<WorkerStatus>,
    state: WorkerState,
    queue: &DeploymentQueue<N>,
    messages_handled: u64,
) {
    status.send_replace(WorkerStatus {
        state,
        queue_len: queue.len(),
        messages_handled,
        lock: queue.lock_state().clone(),
    });
}

async fn handle_message<N: QueueNotifier>(queue: &mut DeploymentQueue<N>, msg: WorkerMessage) {
    match msg {
        WorkerMessage::Revision(mut info) => {
            if queue.contains(&info.id) {
                debug!(deployment = %info.id, "revision already queued");
                return;
            }
            let position = queue.position_for(info.trigger());
            info.check_run_id = queue
                .notifier()
                .on_revision_queued(&info, position, queue.lock_state())
                .await;
            debug!(deployment = %info.id, position, "revision queued");
            queue.push(info);
        }
        WorkerMessage::NotifyQueueStatus => queue.refresh_queued_revisions().await,
    }
}
