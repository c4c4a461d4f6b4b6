//! Wiring of runners for the running service.
//!
//! Each runner gets its own check-run cache and Terraform runner; the GitHub
//! lane, plan reviews, feature allocator and audit notifier are shared.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::feature::{Allocator, FeatureContext, FeatureName, StaticAllocator};
use crate::github::{GitHubLane, OctocrabClient};
use crate::notifier::{CheckRunCache, CheckRunNotifier, CheckRunQueueNotifier, Notifier, StateReceiver};
use crate::persistence::FileDeploymentStore;
use crate::rebaser::{PrRevisionSetter, PullRebaser};
use crate::terraform::{
    CommandExecutor, GitCheckout, LocalTerraformWorkflow, PlanReviews, TerraformWorkflowRunner,
};
use crate::worker::{
    Deployer, NoopQueueNotifier, PostDeployExecutor, PullRequestProcessor, Runner, RunnerAction,
    RunnerFactory, RunnerKey, RunnerMode, RunnerSignal,
};

type LocalRunner = TerraformWorkflowRunner<LocalTerraformWorkflow<CommandExecutor, GitCheckout>>;

/// Builds deploy and plan runners backed by GitHub, the local Terraform
/// binary and the file-backed deployment store.
pub struct ServiceRunnerFactory {
    lane: GitHubLane,
    reviews: PlanReviews,
    features: Arc<StaticAllocator>,
    audit: Option<Arc<dyn Notifier>>,
    executor: CommandExecutor,
    config: Arc<Config>,
}

impl ServiceRunnerFactory {
    pub fn new(lane: GitHubLane, reviews: PlanReviews, config: Arc<Config>) -> Self {
        ServiceRunnerFactory {
            lane,
            reviews,
            features: Arc::new(config.features.clone()),
            audit: None,
            executor: CommandExecutor::new(&config.terraform_bin),
            config,
        }
    }

    /// External notifier for apply audits, used where the audit-log feature is on.
    pub fn with_audit(mut self, audit: Arc<dyn Notifier>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn terraform(&self, key: &RunnerKey, cache: Arc<CheckRunCache<OctocrabClient>>) -> LocalRunner {
        let internal: Vec<Arc<dyn Notifier>> = vec![Arc::new(CheckRunNotifier::new(cache))];
        let ctx = match key.root_name() {
            Some(root) => FeatureContext::root(key.repo.id(), root),
            None => FeatureContext::repo(key.repo.id()),
        };
        let external: Vec<Arc<dyn Notifier>> = match &self.audit {
            Some(audit) if self.features.should_allocate(FeatureName::AuditLog, &ctx) => vec![audit.clone()],
            _ => Vec::new(),
        };
        let workflow = LocalTerraformWorkflow::new(
            self.executor.clone(),
            GitCheckout::new(&self.config.checkout_dir),
            self.reviews.clone(),
        );
        TerraformWorkflowRunner::new(workflow, StateReceiver::new(internal, external))
    }

    fn runner(&self, key: &RunnerKey, signals: mpsc::Receiver<RunnerSignal>, cancel: CancellationToken) -> Runner {
        Runner::new(key.mode(), key.repo.clone(), self.config.runner, signals, cancel)
    }
}

impl RunnerFactory for ServiceRunnerFactory {
    fn spawn(
        &self,
        key: &RunnerKey,
        signals: mpsc::Receiver<RunnerSignal>,
        cancel: CancellationToken,
        predecessor: Option<JoinHandle<RunnerAction>>,
    ) -> JoinHandle<RunnerAction> {
        debug!(runner = %key, "building runner");
        let github = self.lane.client_for(key.repo.id());
        let cache = Arc::new(CheckRunCache::new(github.clone()));
        let terraform = self.terraform(key, cache.clone());
        let runner = self.runner(key, signals, cancel).after(predecessor);

        match key.mode() {
            RunnerMode::Deploy => {
                let rebaser = PullRebaser::new(github);
                let allocator: Arc<dyn Allocator> = self.features.clone();
                let post_deploy: Vec<Arc<dyn PostDeployExecutor>> =
                    vec![Arc::new(PrRevisionSetter::new(rebaser, allocator))];
                let deployer = Deployer::new(
                    cache.clone(),
                    FileDeploymentStore::new(&self.config.state_dir),
                    terraform,
                )
                .with_post_deploy(post_deploy);
                tokio::spawn(runner.run(deployer, CheckRunQueueNotifier::new(cache)))
            }
            RunnerMode::PullRequest => tokio::spawn(
                runner.run(PullRequestProcessor::new(terraform), NoopQueueNotifier),
            ),
        }
    }
}
