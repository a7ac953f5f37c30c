//! Love-me WebSocket gateway (C11).
//!
//! Exposes a single loopback WebSocket endpoint. No authentication, no REST
//! surface: the daemon assumes a trusted local client (§1 Non-goals).

pub mod email_tool;
pub mod error;
pub mod notify;
pub mod runtime;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use runtime::run;

/// Build the gateway's axum router: `/ws` plus a bare liveness probe.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
