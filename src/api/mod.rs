//! Gateway HTTP API: session REST surface and the websocket packet stream

pub mod sessions;
pub mod ws;

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::session::SessionRegistry;

/// Shared state for API handlers
pub struct ApiState {
    /// Live session table and pipeline cache
    pub registry: Arc<SessionRegistry>,
}

/// Build the full gateway router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .merge(sessions::router(Arc::clone(&state)))
        .merge(ws::router(Arc::clone(&state)))
        .merge(health_router(state))
        .layer(TraceLayer::new_for_http())
}

fn health_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    live_sessions: usize,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        live_sessions: state.registry.live_count().await,
    })
}

/// Serve the gateway until ctrl-c
///
/// # Errors
///
/// Returns error if the listener cannot bind or the server fails
pub async fn serve(state: Arc<ApiState>, port: u16) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "presence gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
