//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::models::{ComponentHealth, HealthResponse};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}

/// 200 when the store answers, 503 otherwise.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = Vec::new();

    components.push(match state.queue.stats().await {
        Ok(_) => ComponentHealth::healthy("database"),
        Err(e) => ComponentHealth::unhealthy("database", e.to_string()),
    });

    if let Some(dispatcher) = &state.dispatcher {
        let mut component = ComponentHealth::healthy("dispatcher");
        component.message = Some(format!(
            "running={} in_flight={}",
            dispatcher.is_running(),
            dispatcher.in_flight()
        ));
        components.push(component);
    }

    let healthy = components.iter().all(ComponentHealth::is_healthy);
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        components,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": state.start_time.elapsed().as_secs()
        })),
    )
}
