use axum::{Json, extract::State, http::StatusCode};
use pipeline::ComponentHealth;
use serde::Serialize;

use crate::registry::RegistryStats;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub components: Vec<ComponentHealth>,
    pub connections: RegistryStats,
}

/// GET /health
/// 503 as soon as any processor has halted.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.health.is_healthy();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        components: state.health.snapshot(),
        connections: state.registry.stats(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
