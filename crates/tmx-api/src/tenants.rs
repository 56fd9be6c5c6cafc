//! Tenant endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use tmx_common::{ConsumerSnapshot, Tenant};

use crate::error::{parse_tenant_id, AppError, ErrorResponse};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTenantRequest {
    #[serde(default)]
    pub name: String,
    /// Worker count; missing or non-positive values use the default of 3
    pub concurrency_config: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateConcurrencyRequest {
    pub workers: i64,
}

#[utoipa::path(
    post,
    path = "/api/v1/tenants",
    tag = "tenants",
    request_body = CreateTenantRequest,
    responses(
        (status = 201, description = "Tenant created and consumer started", body = Tenant),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 503, description = "Broker or database unavailable", body = ErrorResponse)
    )
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), AppError> {
    let tenant = state.tenants.create_tenant(&req.name, req.concurrency_config).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants",
    tag = "tenants",
    responses(
        (status = 200, description = "All tenants", body = Vec<Tenant>)
    )
)]
pub async fn list_tenants(State(state): State<AppState>) -> Result<Json<Vec<Tenant>>, AppError> {
    Ok(Json(state.tenants.list_tenants().await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}",
    tag = "tenants",
    params(
        ("id" = String, Path, description = "Tenant ID")
    ),
    responses(
        (status = 200, description = "Tenant found", body = Tenant),
        (status = 400, description = "Malformed tenant id", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse)
    )
)]
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>, AppError> {
    let id = parse_tenant_id(&id)?;
    Ok(Json(state.tenants.get_tenant(id).await?))
}

#[utoipa::path(
    delete,
    path = "/api/v1/tenants/{id}",
    tag = "tenants",
    params(
        ("id" = String, Path, description = "Tenant ID")
    ),
    responses(
        (status = 204, description = "Tenant deleted"),
        (status = 404, description = "Tenant not found", body = ErrorResponse)
    )
)]
pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_tenant_id(&id)?;
    state.tenants.delete_tenant(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/api/v1/tenants/{id}/config/concurrency",
    tag = "tenants",
    params(
        ("id" = String, Path, description = "Tenant ID")
    ),
    request_body = UpdateConcurrencyRequest,
    responses(
        (status = 200, description = "Concurrency updated", body = Tenant),
        (status = 400, description = "Workers must be positive", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse)
    )
)]
pub async fn update_concurrency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateConcurrencyRequest>,
) -> Result<Json<Tenant>, AppError> {
    let id = parse_tenant_id(&id)?;
    Ok(Json(state.tenants.update_concurrency(id, req.workers).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}/consumer",
    tag = "tenants",
    params(
        ("id" = String, Path, description = "Tenant ID")
    ),
    responses(
        (status = 200, description = "Live consumer state", body = ConsumerSnapshot),
        (status = 404, description = "No consumer for this tenant", body = ErrorResponse)
    )
)]
pub async fn consumer_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConsumerSnapshot>, AppError> {
    let id = parse_tenant_id(&id)?;
    Ok(Json(state.tenants.consumer_status(id).await?))
}
