//! Reference signaling relay for two-party calls.

pub mod config;
pub mod handlers;
pub mod rooms;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, ice_servers};
use crate::websocket::{websocket_handler, RelayState};

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ice-servers", get(ice_servers))
        .route("/ws/:session_id", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
