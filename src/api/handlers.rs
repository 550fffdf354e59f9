use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::collections::HashMap;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::schemas::{HealthResponse, RootResponse};

pub(crate) async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Autograder API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub(crate) async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut status = "healthy".to_string();
    let mut components = HashMap::new();

    match state.backend().get_server_user(crate::models::user::ROOT_EMAIL).await {
        Ok(Some(_)) => {
            components.insert(state.backend().name().to_string(), "healthy".to_string());
        }
        Ok(None) => {
            components.insert(state.backend().name().to_string(), "missing root user".to_string());
            status = "degraded".to_string();
        }
        Err(err) => {
            components.insert(state.backend().name().to_string(), format!("unhealthy: {err:#}"));
            status = "unhealthy".to_string();
        }
    }

    components.insert("runner".to_string(), state.runner().name().to_string());
    components.insert("locks".to_string(), state.locks().len().to_string());

    Json(HealthResponse { service: "autograder".to_string(), status, components })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.settings().telemetry().prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match metrics::render() {
        Some(body) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
