//! TenantMux HTTP API
//!
//! axum routes over the tenant and message services, plus health, metrics
//! and the OpenAPI document.

pub mod error;
pub mod tenants;
pub mod messages;
pub mod health;
pub mod openapi;

use std::sync::Arc;

use axum::routing::{get, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tmx_queue::BrokerClient;
use tmx_router::{ConsumerRegistry, MessageService, TenantService};

pub use error::{AppError, ErrorResponse};
pub use openapi::ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantService>,
    pub messages: Arc<MessageService>,
    pub registry: Arc<ConsumerRegistry>,
    pub client: Arc<BrokerClient>,
    /// Absent when no Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tenants", get(tenants::list_tenants).post(tenants::create_tenant))
        .route("/tenants/:id", get(tenants::get_tenant).delete(tenants::delete_tenant))
        .route("/tenants/:id/config/concurrency", put(tenants::update_concurrency))
        .route("/tenants/:id/consumer", get(tenants::consumer_status))
        .route("/messages", get(messages::get_messages).post(messages::publish_message))
        .route("/messages/count", get(messages::count_messages));

    Router::new()
        .nest("/api/v1", api)
        .route("/health-check", get(health::health_check))
        .route("/ping", get(health::ping))
        .route("/metrics", get(health::metrics))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
