//! OpenAPI Documentation

use utoipa::OpenApi;

use tmx_common::{ConsumerSnapshot, ConsumerState, Message, MessagePage, Tenant};

use crate::error::ErrorResponse;
use crate::health::HealthResponse;
use crate::messages::{CountResponse, PublishMessageRequest, PublishResponse};
use crate::tenants::{CreateTenantRequest, UpdateConcurrencyRequest};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "TenantMux API",
        version = "0.1.0",
        description = "Per-tenant queues with live-resizable consumers"
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "tenants", description = "Tenant lifecycle and consumer state"),
        (name = "messages", description = "Publishing and reading messages"),
        (name = "monitoring", description = "Health and metrics")
    ),
    paths(
        super::tenants::create_tenant,
        super::tenants::list_tenants,
        super::tenants::get_tenant,
        super::tenants::delete_tenant,
        super::tenants::update_concurrency,
        super::tenants::consumer_status,
        super::messages::publish_message,
        super::messages::get_messages,
        super::messages::count_messages,
        super::health::health_check,
        super::health::ping,
        super::health::metrics,
    ),
    components(schemas(
        Tenant,
        Message,
        MessagePage,
        ConsumerSnapshot,
        ConsumerState,
        CreateTenantRequest,
        UpdateConcurrencyRequest,
        PublishMessageRequest,
        PublishResponse,
        CountResponse,
        HealthResponse,
        ErrorResponse,
    ))
)]
pub struct ApiDoc;
