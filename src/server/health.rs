//! Health check endpoint for liveness checks.
//!
//! Returns 200 while signals are accepted and 503 once shutdown has begun,
//! so a load balancer stops routing new deploys to a draining instance.

use axum::extract::State;
use axum::http::StatusCode;

use super::AppState;

/// Health check handler.
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// OK (3 runners)
/// ```
pub async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, String) {
    let signals = app_state.signals();
    if signals.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down".into());
    }
    let runners = signals.runner_count().await;
    (StatusCode::OK, format!("OK ({} runners)", runners))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terraform::PlanReviews;
    use crate::worker::{Dispatcher, RunnerAction, RunnerFactory, RunnerKey, RunnerSignal};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    struct IdleFactory;

    impl RunnerFactory for IdleFactory {
        fn spawn(
            &self,
            _key: &RunnerKey,
            mut signals: mpsc::Receiver<RunnerSignal>,
            cancel: CancellationToken,
            _predecessor: Option<JoinHandle<RunnerAction>>,
        ) -> JoinHandle<RunnerAction> {
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => RunnerAction::OnCancel,
                    _ = async { while signals.recv().await.is_some() {} } => RunnerAction::OnUnknown,
                }
            })
        }
    }

    #[tokio::test]
    async fn healthy_until_shutdown() {
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(IdleFactory, shutdown.clone()));
        let state = AppState::new(dispatcher, PlanReviews::new());

        let (status, body) = health_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK (0 runners)");

        shutdown.cancel();
        let (status, _) = health_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
