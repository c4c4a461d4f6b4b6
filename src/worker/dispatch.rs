//! Signal routing to per-root and per-pull-request runners.
//!
//! ```text
//!                                   ┌──────────────────────────────┐
//!                              ┌──► │ acme/infra root "network"    │ ──► deploy runner
//! ┌─────────────┐   ┌────────┐ │    └──────────────────────────────┘
//! │   axum      │──►│dispatch│─┤    ┌──────────────────────────────┐
//! │  (accepts)  │   │ by key │ └──► │ acme/infra pull request #42  │ ──► plan runner
//! └─────────────┘   └────────┘      └──────────────────────────────┘
//! ```
//!
//! Runners are started lazily by the first new-revision signal for their key
//! and started again if a signal arrives after the previous runner closed its
//! channel. A replacement never overlaps a predecessor that is still working
//! off its last signals. Unlock and close signals never start a runner.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

use super::message::RunnerSignal;
use super::runner::{DEFAULT_CHANNEL_BUFFER, RunnerAction, RunnerMode};
use crate::types::{PrNumber, Repo};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("runner {0} stopped accepting signals")]
    ChannelClosed(RunnerKey),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunnerScope {
    Root(String),
    PullRequest(PrNumber),
}

/// Identity of one runner.
///
/// Keys compare by owner, name and scope; the default branch carried in
/// `repo` is configuration of the runner, not part of its identity.
#[derive(Debug, Clone)]
pub struct RunnerKey {
    pub repo: Repo,
    pub scope: RunnerScope,
}

impl PartialEq for RunnerKey {
    fn eq(&self, other: &Self) -> bool {
        self.repo.owner == other.repo.owner
            && self.repo.name == other.repo.name
            && self.scope == other.scope
    }
}

impl Eq for RunnerKey {}

impl Hash for RunnerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repo.owner.hash(state);
        self.repo.name.hash(state);
        self.scope.hash(state);
    }
}

impl RunnerKey {
    pub fn root(repo: Repo, root: impl Into<String>) -> Self {
        RunnerKey {
            repo,
            scope: RunnerScope::Root(root.into()),
        }
    }

    pub fn pull_request(repo: Repo, number: PrNumber) -> Self {
        RunnerKey {
            repo,
            scope: RunnerScope::PullRequest(number),
        }
    }

    pub fn root_name(&self) -> Option<&str> {
        match &self.scope {
            RunnerScope::Root(root) => Some(root),
            RunnerScope::PullRequest(_) => None,
        }
    }

    pub fn mode(&self) -> RunnerMode {
        match self.scope {
            RunnerScope::Root(_) => RunnerMode::Deploy,
            RunnerScope::PullRequest(_) => RunnerMode::PullRequest,
        }
    }
}

impl fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            RunnerScope::Root(root) => write!(f, "{}:{}", self.repo, root),
            RunnerScope::PullRequest(pr) => write!(f, "{}{}", self.repo, pr),
        }
    }
}

/// Builds and spawns the runner for a key.
///
/// `predecessor` is the key's previous runner if it has not exited yet; the
/// new runner must not handle signals before it has.
pub trait RunnerFactory: Send + Sync {
    fn spawn(
        &self,
        key: &RunnerKey,
        signals: mpsc::Receiver<RunnerSignal>,
        cancel: CancellationToken,
        predecessor: Option<JoinHandle<RunnerAction>>,
    ) -> JoinHandle<RunnerAction>;
}

struct RunnerHandle {
    tx: mpsc::Sender<RunnerSignal>,
    task: JoinHandle<RunnerAction>,
    cancel: CancellationToken,
}

impl RunnerHandle {
    fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.tx.is_closed()
    }

    fn has_exited(&self) -> bool {
        self.task.is_finished()
    }
}

/// Drops handles of runners that have exited; returns how many.
fn reap_exited(runners: &mut HashMap<RunnerKey, RunnerHandle>) -> usize {
    let before = runners.len();
    runners.retain(|key, handle| {
        let exited = handle.has_exited();
        if exited {
            trace!(runner = %key, "reaping runner");
        }
        !exited
    });
    before - runners.len()
}

pub struct Dispatcher<F> {
    factory: F,
    runners: RwLock<HashMap<RunnerKey, RunnerHandle>>,
    shutdown: CancellationToken,
    channel_buffer: usize,
}

impl<F: RunnerFactory> Dispatcher<F> {
    pub fn new(factory: F, shutdown: CancellationToken) -> Self {
        Dispatcher {
            factory,
            runners: RwLock::new(HashMap::new()),
            shutdown,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Delivers a signal to the key's runner, starting one if needed.
    #[instrument(skip(self, signal), fields(runner = %key))]
    pub async fn signal(&self, key: &RunnerKey, signal: RunnerSignal) -> Result<()> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        let starts = matches!(signal, RunnerSignal::NewRevision(_));

        let tx = match self.live_sender(key).await {
            Some(tx) => tx,
            None if starts => self.spawn_runner(key).await,
            None => {
                debug!("no runner, signal dropped");
                return Ok(());
            }
        };

        match tx.send(signal).await {
            Ok(()) => Ok(()),
            // The runner exited between lookup and send.
            Err(mpsc::error::SendError(signal)) if starts => {
                debug!("runner exited, starting a new one");
                let tx = self.spawn_runner(key).await;
                tx.send(signal)
                    .await
                    .map_err(|_| DispatchError::ChannelClosed(key.clone()))
            }
            Err(_) => Ok(()),
        }
    }

    async fn live_sender(&self, key: &RunnerKey) -> Option<mpsc::Sender<RunnerSignal>> {
        let runners = self.runners.read().await;
        runners
            .get(key)
            .filter(|handle| handle.is_live())
            .map(|handle| handle.tx.clone())
    }

    async fn spawn_runner(&self, key: &RunnerKey) -> mpsc::Sender<RunnerSignal> {
        let mut runners = self.runners.write().await;

        if let Some(handle) = runners.get(key)
            && handle.is_live()
        {
            return handle.tx.clone();
        }

        reap_exited(&mut runners);
        // Whatever is left for the key closed its channel but is still draining.
        let predecessor = runners.remove(key).map(|handle| handle.task);
        debug!(after_predecessor = predecessor.is_some(), "spawning runner");
        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let cancel = self.shutdown.child_token();
        let task = self.factory.spawn(key, rx, cancel.clone(), predecessor);
        runners.insert(
            key.clone(),
            RunnerHandle {
                tx: tx.clone(),
                task,
                cancel,
            },
        );
        tx
    }

    /// Number of runners that have not exited.
    pub async fn runner_count(&self) -> usize {
        self.runners
            .read()
            .await
            .values()
            .filter(|h| h.is_live())
            .count()
    }

    pub async fn has_runner(&self, key: &RunnerKey) -> bool {
        self.live_sender(key).await.is_some()
    }

    /// Drops handles of runners that have exited.
    pub async fn reap(&self) -> usize {
        reap_exited(&mut *self.runners.write().await)
    }

    /// Cancels one runner. Returns whether it existed.
    pub async fn remove(&self, key: &RunnerKey) -> bool {
        match self.runners.write().await.remove(key) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every runner and waits for them to wind down.
    pub async fn shutdown_all(&self) {
        info!("shutting down all runners");
        self.shutdown.cancel();

        let handles: Vec<_> = self.runners.write().await.drain().collect();
        for (key, handle) in handles {
            handle.cancel.cancel();
            match handle.task.await {
                Ok(exit) => trace!(runner = %key, %exit, "runner joined"),
                Err(e) => error!(runner = %key, error = %e, "runner task failed"),
            }
        }
    }
}
