use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{error, info};

use super::{
    services::{
        admin_dead_letters, admin_reset_due_quotas, admin_reset_quota, admin_set_allotment,
        batch_jobs, cancel_batch, create_batch, delete_batch, download_archive, get_batch, get_job,
        get_quota, health, list_batches, pack_batch, preview_batch,
    },
    state::{AnyError, AppState},
};
use crate::config::Config;
use crate::storage::StorageClient;
use crate::verifier::HttpFormTarget;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// All routes over an assembled state
pub fn router(state: AppState) -> Router {
    let max_payload = state.config.server.max_payload_bytes.as_usize();
    let max_concurrent = state.config.server.max_concurrent_requests;

    Router::new()
        .route("/batches", post(create_batch).get(list_batches))
        .route("/batches/preview", post(preview_batch))
        .route("/batches/{batch_id}", get(get_batch).delete(delete_batch))
        .route("/batches/{batch_id}/jobs", get(batch_jobs))
        .route("/batches/{batch_id}/cancel", post(cancel_batch))
        .route(
            "/batches/{batch_id}/archive",
            post(pack_batch).get(download_archive),
        )
        .route("/jobs/{job_id}", get(get_job))
        .route("/quota", get(get_quota))
        .route("/health", get(health))
        .route("/admin/dead-letters", get(admin_dead_letters))
        .route("/admin/quota/reset-due", post(admin_reset_due_quotas))
        .route("/admin/quota/{owner_id}", put(admin_set_allotment))
        .route("/admin/quota/{owner_id}/reset", post(admin_reset_quota))
        .with_state(state)
        // Gzip request bodies are decoded before the handlers see them
        .layer(RequestDecompressionLayer::new())
        .layer(DefaultBodyLimit::max(max_payload))
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
}

pub async fn run(config: Config) -> Result<(), AnyError> {
    let address = config.server.bind_addr;

    let storage = StorageClient::from_config(&config.storage)
        .map_err(|e| format!("Failed to initialize storage: {}", e))?;
    let target = Arc::new(
        HttpFormTarget::from_config(&config.verifier)
            .map_err(|e| format!("Failed to build verification client: {}", e))?,
    );

    let (state, workers) = AppState::assemble(config, target, storage).await?;
    info!(workers = workers.len(), "Dispatcher running");

    let maintenance = tokio::spawn(maintenance_loop(state.clone()));
    let store = state.store.clone();
    let queue = state.queue.clone();
    let app = router(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "vatproof API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    for worker in &workers {
        worker.abort();
    }
    // Interrupted jobs stay unacknowledged and are replayed on next start
    store
        .persist()
        .map_err(|e| format!("Failed to persist ledger: {}", e))?;
    queue
        .read()
        .await
        .flush()
        .map_err(|e| format!("Failed to flush task queue: {}", e))?;
    info!("Ledger and queue persisted, bye");

    Ok(())
}

/// Periodic housekeeping, see [`AppState::run_maintenance`]
async fn maintenance_loop(state: AppState) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        state.run_maintenance().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
