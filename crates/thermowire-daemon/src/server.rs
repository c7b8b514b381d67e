//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api;
use crate::state::AppState;
use crate::ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // API routes
        .route("/api/devices", get(api::list_devices))
        .route(
            "/api/devices/{name}",
            get(api::get_device).put(api::assign_name),
        )
        .route("/api/scan", post(api::trigger_scan))
        .route("/api/config", get(api::get_config))
        .route("/api/buses", get(api::list_buses).post(api::add_bus))
        .route("/api/buses/{id}", delete(api::remove_bus))
        .route(
            "/api/poll-interval",
            get(api::get_poll_interval).put(api::set_poll_interval),
        )
        // WebSocket for live events
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the engine and serve until Ctrl-C
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    state.start().await?;

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.stop().await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
