//! HTTP surface of the service.
//!
//! # Endpoints
//!
//! - `POST /api/v1/repos/{owner}/{repo}/roots/{root}/revisions` - deploy a revision of a root
//! - `POST /api/v1/repos/{owner}/{repo}/roots/{root}/unlock` - resume merge deploys of a root
//! - `POST /api/v1/repos/{owner}/{repo}/pulls/{number}/revisions` - plan a pull request revision
//! - `POST /api/v1/repos/{owner}/{repo}/pulls/{number}/close` - stop planning a pull request
//! - `POST /api/v1/deployments/{id}/review` - confirm or reject a waiting plan
//! - `GET /health` - 200 while accepting signals, 503 while shutting down
//!
//! Signal routes answer `202 Accepted` once the signal is handed to its
//! runner; processing is asynchronous.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::terraform::PlanReviews;
use crate::worker::{DispatchError, Dispatcher, RunnerFactory, RunnerKey, RunnerSignal};

pub mod health;
pub mod signals;

pub use health::health_handler;

/// Where signal routes deliver to.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn signal(&self, key: &RunnerKey, signal: RunnerSignal) -> Result<(), DispatchError>;

    async fn runner_count(&self) -> usize;

    fn is_shutting_down(&self) -> bool;
}

#[async_trait]
impl<F: RunnerFactory> SignalSink for Dispatcher<F> {
    async fn signal(&self, key: &RunnerKey, signal: RunnerSignal) -> Result<(), DispatchError> {
        Dispatcher::signal(self, key, signal).await
    }

    async fn runner_count(&self) -> usize {
        Dispatcher::runner_count(self).await
    }

    fn is_shutting_down(&self) -> bool {
        Dispatcher::is_shutting_down(self)
    }
}

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    signals: Arc<dyn SignalSink>,
    reviews: PlanReviews,
}

impl AppState {
    pub fn new(signals: Arc<dyn SignalSink>, reviews: PlanReviews) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { signals, reviews }),
        }
    }

    pub fn signals(&self) -> &dyn SignalSink {
        self.inner.signals.as_ref()
    }

    pub fn reviews(&self) -> &PlanReviews {
        &self.inner.reviews
    }
}

/// A path segment that cannot name an owner, repository or root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path component: {0:?}")]
pub struct InvalidPathComponent(pub String);

const MAX_PATH_COMPONENT_LEN: usize = 255;

/// Rejects empty, dot, over-long and separator-bearing components.
pub fn validate_path_component(component: &str) -> Result<(), InvalidPathComponent> {
    let invalid = component.is_empty()
        || component == "."
        || component == ".."
        || component.len() > MAX_PATH_COMPONENT_LEN
        || component.contains(['/', '\\', '\0']);
    if invalid {
        return Err(InvalidPathComponent(component.to_string()));
    }
    Ok(())
}

pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route(
            "/api/v1/repos/{owner}/{repo}/roots/{root}/revisions",
            post(signals::deploy_revision_handler),
        )
        .route(
            "/api/v1/repos/{owner}/{repo}/roots/{root}/unlock",
            post(signals::unlock_handler),
        )
        .route(
            "/api/v1/repos/{owner}/{repo}/pulls/{number}/revisions",
            post(signals::pull_request_revision_handler),
        )
        .route(
            "/api/v1/repos/{owner}/{repo}/pulls/{number}/close",
            post(signals::pull_request_close_handler),
        )
        .route("/api/v1/deployments/{id}/review", post(signals::review_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
