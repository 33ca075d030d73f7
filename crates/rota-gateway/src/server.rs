//! HTTP server implementation using Axum.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, put},
};
use rota_scheduler::{RunStore, SchedulerHandle};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    /// Read-only access to captured command output.
    pub store: RunStore,
    /// Config file used by reload and test.
    pub config_path: PathBuf,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(scheduler: SchedulerHandle, store: RunStore, config_path: PathBuf) -> Self {
        Self {
            scheduler,
            store,
            config_path,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/health", get(super::routes::health_check))
        // Status
        .route("/api/v1/jobs", get(super::routes::list_jobs))
        .route("/api/v1/jobs/{name}", get(super::routes::get_job))
        .route("/api/v1/jobs/{name}/{run_id}", get(super::routes::get_run))
        .route(
            "/api/v1/jobs/{name}/{run_id}/{host_index}/{command_index}/{stream}",
            get(super::routes::get_output),
        )
        // Control
        .route("/api/v1/reload", put(super::routes::reload))
        .route("/api/v1/test", put(super::routes::test_config))
        .route("/api/v1/run/{name}", put(super::routes::run_job))
        .route("/api/v1/fail/{name}", put(super::routes::fail_job))
        .route("/api/v1/status/{name}", put(super::routes::set_status))
        .route("/api/v1/pool/{name}", put(super::routes::update_pool))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve the API on `listener` until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("🌐 API listening on http://{}", addr);
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("🌐 API stopped");
    Ok(())
}
