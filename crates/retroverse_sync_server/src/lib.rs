//! Retroverse Sync Server
//!
//! An HTTP server exposing the Retroverse daton protocol: one main endpoint
//! for session setup, loads, subscriptions and saves, and a long-poll
//! endpoint through which changed datons are pushed.
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3040)
//! - `SCHEMA_PATH`: JSON schema catalog (default: ./schema.json)
//! - `DATA_DIR`: Data stores and users database (default: ./data)
//! - `LOCK_DATABASE_PATH`: Lock store shared by every server process (default: <DATA_DIR>/locks.db)
//! - `LONG_POLL_SECONDS`: Long-poll wait (default: 30)
//! - `SESSION_IDLE_SECONDS`: Idle session lifetime (default: 180)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `DEV_USER_TOKEN`: API token registered for a `dev` user at startup

pub mod auth;
pub mod config;
pub mod db;
pub mod handlers;

pub use config::Config;

use auth::UserAuth;
use axum::{
    Router,
    extract::Extension,
    http::{HeaderValue, Method, header},
    routing::get,
};
use handlers::{
    api::ApiState,
    api_routes,
    retro::RetroState,
    retro_routes,
};
use retroverse_core::Retroverse;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the application router
pub fn build_router(retro: Arc<Retroverse>, auth: UserAuth, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    let cors = if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    };

    Router::new()
        // Health check
        .route("/", get(|| async { "Retroverse Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // Status and sync protocol
        .nest(
            "/api",
            api_routes(ApiState { retro: retro.clone() }).merge(retro_routes(RetroState { retro })),
        )
        // Add layers
        .layer(Extension(auth))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
