use axum::{Router, extract::State, response::Json, routing::get};
use retroverse_core::Retroverse;
use serde::Serialize;
use std::sync::Arc;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub retro: Arc<Retroverse>,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub server_id: String,
    pub active_sessions: usize,
    pub cached_datons: usize,
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(state)
}

/// GET /api/status - Get server status (public endpoint)
pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        server_id: state.retro.locks().server_id().to_string(),
        active_sessions: state.retro.plex().session_count(),
        cached_datons: state.retro.cache().len(),
    })
}
