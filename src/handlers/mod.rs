pub mod charges;
pub mod query;
pub mod webhook;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::gateway::CircuitState;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub gateway: CircuitState,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = state.gateway.circuit_state();

    // 503 while the breaker refuses gateway calls
    let (status_code, status) = match gateway {
        CircuitState::Closed => (StatusCode::OK, "healthy"),
        CircuitState::Open => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    let body = HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        gateway,
    };
    (status_code, Json(body))
}
