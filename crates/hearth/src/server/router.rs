//! HTTP Router
//!
//! Sets up the axum router with the WebSocket endpoint.

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::transport::LinkState;

use super::handler::handle_websocket;
use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub clients: usize,
    pub devices: usize,
    pub armed: bool,
    pub controller: LinkState,
}

pub fn health(state: &AppState) -> HealthResponse {
    let hub = state.hub();
    HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        clients: state.client_count(),
        devices: hub.devices().len(),
        armed: hub.is_armed(),
        controller: state.link_state(),
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health(&state))
}
