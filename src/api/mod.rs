pub mod error;
mod handlers;
mod web;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::broker::CaptureBroker;
use crate::transport::Transport;

use handlers::*;

/// Full-frame data URLs run to several megabytes.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Shared state for the front-door handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: CaptureBroker,
    pub transport: Arc<dyn Transport>,
}

/// The HTTP front door: browser event stream and callbacks, session
/// listing, sampling, health and the embedded UI. `mcp` carries the
/// `/mcp` routes when MCP runs over HTTP.
pub fn router(state: AppState, mcp: Option<Router>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/api/events", get(browser_events))
        .route("/api/capture-result", post(capture_result))
        .route("/api/capture-error", post(capture_error))
        .route("/api/sessions", get(list_sessions))
        .route("/api/process-sample", post(process_sample))
        .with_state(state);

    let router = match mcp {
        Some(mcp) => api.merge(mcp),
        None => api,
    };

    router
        .fallback(web::web_asset)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
}
