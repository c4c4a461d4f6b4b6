//! Runners, workers and the revision processing they drive.
//!
//! Every deploy root and every open pull request gets a dedicated runner.
//! A runner owns one worker task, which processes that key's revisions
//! serially; different keys are processed concurrently.
//!
//! # Module Structure
//!
//! - [`queue`]: priority queue of revisions with the merge lock
//! - [`message`]: signals and worker messages
//! - [`processor`]: what happens to one dequeued revision
//! - [`deployer`]: the deploy-mode processor
//! - [`pr_processor`]: the pull-request (plan only) processor
//! - [`post_deploy`]: hooks run after a successful deploy
//! - [`worker`]: the queue-draining loop
//! - [`runner`]: signal multiplexing, timeouts and shutdown
//! - [`dispatch`]: routing of signals to runners

pub mod deployer;
pub mod dispatch;
pub mod message;
pub mod post_deploy;
pub mod pr_processor;
pub mod processor;
pub mod queue;
pub mod runner;
pub mod worker;


pub use deployer::Deployer;
pub use dispatch::{DispatchError, Dispatcher, RunnerFactory, RunnerKey, RunnerScope};
pub use message::{NewRevisionSignal, RunnerSignal, UnlockSignal, WorkerMessage};
pub use post_deploy::{PostDeployError, PostDeployExecutor};
pub use pr_processor::PullRequestProcessor;
pub use processor::{ProcessError, ProcessOutcome, RevisionProcessor};
pub use queue::{DeploymentQueue, LockState, LockStatus, NoopQueueNotifier, QueueNotifier};
pub use runner::{Runner, RunnerAction, RunnerConfig, RunnerMode};
pub use worker::{Worker, WorkerState, WorkerStatus};
