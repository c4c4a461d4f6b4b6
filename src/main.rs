use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infra_train::app::ServiceRunnerFactory;
use infra_train::config::Config;
use infra_train::github::GitHubLane;
use infra_train::notifier::{AuditNotifier, Notifier};
use infra_train::persistence::JsonlAuditLog;
use infra_train::server::{AppState, build_router};
use infra_train::terraform::PlanReviews;
use infra_train::worker::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,infra_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env().context("loading configuration")?);
    let lane = GitHubLane::from_token(config.github_token.clone(), config.github_concurrency)
        .context("building GitHub client")?;
    let audit_log = JsonlAuditLog::open(&config.audit_log)
        .with_context(|| format!("opening audit log {}", config.audit_log.display()))?;
    let audit: Arc<dyn Notifier> = Arc::new(AuditNotifier::new(audit_log));

    let reviews = PlanReviews::new();
    let factory = ServiceRunnerFactory::new(lane, reviews.clone(), config.clone()).with_audit(audit);
    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(factory, shutdown.clone()));

    let app = build_router(AppState::new(dispatcher.clone(), reviews));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!("listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await
        .context("serving HTTP")?;

    dispatcher.shutdown_all().await;
    Ok(())
}
