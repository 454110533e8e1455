//! HTTP surface: room WebSocket route and health

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use cr_broker::{BreakerStats, CircuitBreaker};

use crate::ingress::{IngressHandler, IngressStats};
use crate::session::SessionRegistry;
use crate::writer::{DurableWriter, WriterStats};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<IngressHandler>,
    pub registry: Arc<SessionRegistry>,
    pub writer: Arc<DurableWriter>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Outbound frames buffered per connection
    pub session_buffer: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub writer_buffer_depth: usize,
    pub ingress: IngressStats,
    pub writer: WriterStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerStats>,
}

/// Build the router. The room endpoint is `<path_prefix>/{room_id}`.
pub fn router(state: AppState, path_prefix: &str) -> Router {
    let prefix = path_prefix.trim_end_matches('/');
    Router::new()
        .route(&format!("{}/{{room_id}}", prefix), get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let writer = state.writer.stats();
    let status = if state.writer.is_running() { "UP" } else { "DOWN" };
    Json(HealthResponse {
        status,
        sessions: state.registry.len(),
        writer_buffer_depth: writer.buffer_depth,
        ingress: state.ingress.stats(),
        writer,
        breaker: state.breaker.as_ref().map(|b| b.stats()),
    })
}
