//! Message endpoints

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use tmx_common::MessagePage;

use crate::error::{parse_tenant_id, AppError, ErrorResponse};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishMessageRequest {
    pub tenant_id: String,
    /// Arbitrary JSON object
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PublishResponse {
    pub status: String,
    pub tenant_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MessagesQuery {
    pub tenant_id: String,
    /// Cursor from a previous page
    pub cursor: Option<String>,
    /// Page size, 1 to 100 (default 10)
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CountQuery {
    pub tenant_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CountResponse {
    pub tenant_id: String,
    pub count: u64,
}

#[utoipa::path(
    post,
    path = "/api/v1/messages",
    tag = "messages",
    request_body = PublishMessageRequest,
    responses(
        (status = 202, description = "Message accepted by the broker", body = PublishResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse),
        (status = 503, description = "Broker unavailable", body = ErrorResponse)
    )
)]
pub async fn publish_message(
    State(state): State<AppState>,
    Json(req): Json<PublishMessageRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let tenant_id = parse_tenant_id(&req.tenant_id)?;
    state.messages.publish(tenant_id, req.payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            status: "accepted".to_string(),
            tenant_id: tenant_id.to_string(),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/messages",
    tag = "messages",
    params(MessagesQuery),
    responses(
        (status = 200, description = "One page of messages", body = MessagePage),
        (status = 400, description = "Malformed tenant id or cursor", body = ErrorResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse)
    )
)]
pub async fn get_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagePage>, AppError> {
    let tenant_id = parse_tenant_id(&query.tenant_id)?;
    // Non-positive limits fall back to the default page size.
    let limit = query
        .limit
        .map(|l| u32::try_from(l.max(0)).unwrap_or(u32::MAX));

    let page = state
        .messages
        .get_messages(tenant_id, query.cursor.as_deref(), limit)
        .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/messages/count",
    tag = "messages",
    params(CountQuery),
    responses(
        (status = 200, description = "Stored message count", body = CountResponse),
        (status = 404, description = "Tenant not found", body = ErrorResponse)
    )
)]
pub async fn count_messages(
    State(state): State<AppState>,
    Query(query): Query<CountQuery>,
) -> Result<Json<CountResponse>, AppError> {
    let tenant_id = parse_tenant_id(&query.tenant_id)?;
    let count = state.messages.count_messages(tenant_id).await?;
    Ok(Json(CountResponse {
        tenant_id: tenant_id.to_string(),
        count,
    }))
}
