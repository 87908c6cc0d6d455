//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the room WebSocket (`/api/ws`), the small room
//! REST surface used before a socket is opened, and a health probe. CORS is
//! wide open; the room credential is the only gate. Request spans mask the
//! credential in the WebSocket query string.

pub mod rooms;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/rooms", post(rooms::create_room))
        .route("/api/rooms/{id}", get(rooms::get_room))
        .route("/api/rooms/{id}/presence", get(rooms::get_presence))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(ws::request_span))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
