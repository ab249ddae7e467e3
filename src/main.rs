use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod api;
mod monitor;
mod storage;
mod sync;
mod utils;

use crate::api::AppState;
use crate::monitor::{MonitorSupervisor, SettleDelays};
use crate::storage::Storage;
use crate::sync::{HttpRemoteStore, RemoteStore, SyncLoop};
use crate::utils::event_log::ActivityLog;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::logging::init_tracing();

    // Load configuration
    let config = utils::config::load_config()?;

    info!("Starting Filewarden v{}", env!("CARGO_PKG_VERSION"));
    info!("Device id: {}", config.device_id);
    match &config.backend_url {
        Some(url) => info!("Remote store: {}", url),
        None => info!("Remote store: not configured, uploads disabled"),
    }

    // Initialize storage layer
    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    let activity = ActivityLog::new(1000); // Keep last 1000 activity entries
    let supervisor = MonitorSupervisor::new(SettleDelays::default(), activity.clone());

    // Background sync: reconciles monitoring with stored config and
    // pushes backups to the remote store
    let remote = config
        .backend_url
        .clone()
        .map(|url| Arc::new(HttpRemoteStore::new(url)) as Arc<dyn RemoteStore>);
    let sync_handle = SyncLoop::spawn(storage.clone(), supervisor.clone(), remote, &config);
    sync_handle.trigger();

    let port = config.port;
    let state = AppState {
        config: Arc::new(config),
        storage,
        supervisor: supervisor.clone(),
        activity,
        sync: sync_handle,
    };

    // Build the API router
    let app = Router::new()
        .nest("/api", api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Join all watchers before exiting so no event fires mid-teardown
    supervisor.stop().await;
    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
