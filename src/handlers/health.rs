use axum::{extract::State, http::StatusCode, Json};
use crate::models::HealthResponse;
use crate::pubsub::BrokerHealth;
use crate::state::AppState;
use tracing::debug;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. A broker in fallback still serves local peers,
/// so only a bridge that has never come up reports unavailable.
pub async fn ready_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.bridge.health();
    debug!("Readiness check requested, broker is {}", health);
    match health {
        BrokerHealth::Connected => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                message: "Service is ready".to_string(),
            }),
        ),
        BrokerHealth::Fallback | BrokerHealth::Reconnecting => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "degraded".to_string(),
                message: format!("Broker is {}, updates reach this instance only", health),
            }),
        ),
        BrokerHealth::Connecting | BrokerHealth::Disconnected => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable".to_string(),
                message: format!("Broker is {}", health),
            }),
        ),
    }
}
