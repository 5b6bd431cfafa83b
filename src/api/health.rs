//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness response describing the active backends
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub persona: String,
    pub active_sessions: usize,
    pub backends: Backends,
}

/// Backend in use for each stage of a turn
#[derive(Serialize)]
pub struct Backends {
    pub generator: &'static str,
    pub transcriber: &'static str,
    /// `None` when replies are only simulated
    pub synthesizer: Option<&'static str>,
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe
///
/// Every backend has a local fallback, so a running server is always ready;
/// the body reports which backends answer.
async fn ready(State(state): State<Arc<ApiState>>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        status: "ok",
        persona: state.persona_name.clone(),
        active_sessions: state.sessions.len().await,
        backends: Backends {
            generator: state.generator.name(),
            transcriber: state.transcriber.name(),
            synthesizer: state.synthesizer.as_ref().map(|s| s.name()),
        },
    })
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness router
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}
