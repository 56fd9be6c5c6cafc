//! Health, liveness and metrics endpoints

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub broker_connected: bool,
    pub active_consumers: usize,
}

#[utoipa::path(
    get,
    path = "/health-check",
    tag = "monitoring",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Broker connection lost", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker_connected = state.client.is_connected();
    let status = if broker_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if broker_connected { "UP" } else { "DOWN" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker_connected,
        active_consumers: state.registry.len().await,
    };

    (status, Json(body))
}

#[utoipa::path(
    get,
    path = "/ping",
    tag = "monitoring",
    responses(
        (status = 200, description = "Process is alive", body = String)
    )
)]
pub async fn ping() -> &'static str {
    "pong"
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "monitoring",
    responses(
        (status = 200, description = "Prometheus metrics", body = String, content_type = "text/plain")
    )
)]
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
