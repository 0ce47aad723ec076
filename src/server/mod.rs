//! HTTP server.
//!
//! Wires the job store, hub, logger, sweeper and orchestrator together, serves
//! the deployment API and the published artifacts, and shuts the background
//! tasks down in order when the process is interrupted.

pub mod auth;
pub mod error;
pub mod routes;
pub mod stream;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Extension, Router};
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::core::{
    BroadcastHub, Collaborators, EventLogger, FileJobStore, JobStore, Orchestrator,
    ReconciliationSweeper,
};

pub use auth::{ApiAuth, RequireAuth};
pub use error::ApiError;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Cancelled on shutdown; open event streams end with it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the application router
pub fn router(state: AppState, auth: ApiAuth, artifacts_dir: &Path) -> Router {
    Router::new()
        .merge(routes::deployment_routes())
        .nest_service("/artifacts", ServeDir::new(artifacts_dir))
        .layer(Extension(Arc::new(auth)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until Ctrl-C
pub async fn serve(config: &ResolvedConfig, bind_override: Option<String>) -> Result<()> {
    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(config.jobs_dir())
            .await
            .context("Failed to open job store")?,
    );
    tokio::fs::create_dir_all(config.artifacts_dir())
        .await
        .with_context(|| format!("Failed to create {}", config.artifacts_dir().display()))?;

    let hub = BroadcastHub::new(config.hub.clone());
    let logger = EventLogger::new(store.clone(), hub.clone(), config.logger.clone());
    let orchestrator = Orchestrator::new(
        store,
        logger.clone(),
        Collaborators::from_config(config),
        config.pipeline.clone(),
        config.workspaces.clone(),
    );

    let sweeper = ReconciliationSweeper::new(logger.clone(), &config.sweeper);
    let sweeper_task = sweeper.clone().start();
    let heartbeat_task = hub.start_heartbeats();

    let state = AppState::new(orchestrator);
    let shutdown = state.shutdown.clone();

    let auth = ApiAuth::new(&config.api_tokens);
    if !auth.is_enabled() {
        warn!("No API tokens configured; the API is open to anyone who can reach it");
    }
    let app = router(state, auth, &config.artifacts_dir());

    let bind = bind_override.unwrap_or_else(|| config.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(%bind, home = %config.home.display(), "Deployment server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await
        .context("HTTP server error")?;

    heartbeat_task.stop().await?;
    sweeper_task.stop().await?;

    // Last chance for events still waiting on their record
    let report = sweeper.sweep_once().await;
    if report.still_pending > 0 {
        warn!(jobs = report.still_pending, "Exiting with unreconciled events");
    }
    info!("Server stopped");
    Ok(())
}
