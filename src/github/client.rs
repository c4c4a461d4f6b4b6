//! Octocrab client wrapper scoped to a specific repository.
//!
//! Effects are repo-scoped (`GitHubEffect` variants carry no repo), so the
//! client carries it. All clients built from one [`GitHubLane`] share its
//! concurrency limit, which keeps the whole service under GitHub's secondary
//! rate limits no matter how many runners are active.

use std::sync::Arc;

use octocrab::Octocrab;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::types::RepoId;

/// Default number of concurrent GitHub requests across the whole service.
pub const DEFAULT_GITHUB_CONCURRENCY: usize = 4;

/// A shared, rate-limited path to the GitHub API.
#[derive(Clone)]
pub struct GitHubLane {
    client: Octocrab,
    permits: Arc<Semaphore>,
}

impl GitHubLane {
    pub fn new(client: Octocrab, concurrency: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Creates a lane authenticated with a personal or installation token.
    pub fn from_token(token: impl Into<String>, concurrency: usize) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client, concurrency))
    }

    /// Returns a client scoped to `repo` that shares this lane's limit.
    pub fn client_for(&self, repo: RepoId) -> OctocrabClient {
        OctocrabClient {
            client: self.client.clone(),
            repo,
            permits: self.permits.clone(),
        }
    }
}

impl std::fmt::Debug for GitHubLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubLane")
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

/// A GitHub API client scoped to a specific repository.
#[derive(Clone)]
pub struct OctocrabClient {
    client: Octocrab,
    repo: RepoId,
    permits: Arc<Semaphore>,
}

impl OctocrabClient {
    pub fn inner(&self) -> &Octocrab {
        &self.client
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    pub fn owner(&self) -> &str {
        &self.repo.owner
    }

    pub fn repo_name(&self) -> &str {
        &self.repo.repo
    }

    /// Waits for a slot in the shared lane. Hold the permit for the duration
    /// of one HTTP request.
    pub async fn throttle(&self) -> Option<SemaphorePermit<'_>> {
        // The semaphore is never closed; `None` is unreachable in practice.
        self.permits.acquire().await.ok()
    }
}

impl std::fmt::Debug for OctocrabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctocrabClient")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}
