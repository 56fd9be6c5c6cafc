use serde::{Deserialize, Serialize};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use uuid::Uuid;
use utoipa::ToSchema;

/// Concurrency applied when a tenant is created without a positive value
pub const DEFAULT_CONCURRENCY: u32 = 3;

/// Upper bound on a tenant's worker count
pub const MAX_CONCURRENCY: u32 = 1024;

/// Name of the shared channel used by the publish path
pub const PUBLISHER_CHANNEL: &str = "publisher";

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

// ============================================================================
// Naming
// ============================================================================

/// Queue holding a tenant's pending messages: `tenant_<id>_queue`
pub fn queue_name(tenant_id: &Uuid) -> String {
    format!("tenant_{}_queue", tenant_id)
}

/// Broker channel dedicated to a tenant's consumer: `tenant_<id>`
pub fn channel_name(tenant_id: &Uuid) -> String {
    format!("tenant_{}", tenant_id)
}

pub fn consumer_tag(tenant_id: &Uuid) -> String {
    format!("consumer_{}", tenant_id)
}

/// Physical message partition for a tenant. Dashes are stripped so the name
/// is a plain SQL identifier.
pub fn partition_name(tenant_id: &Uuid) -> String {
    format!("messages_tenant_{}", tenant_id.simple())
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("concurrency must be between 1 and {max}, got {value}", max = MAX_CONCURRENCY)]
pub struct ConcurrencyError {
    pub value: i64,
}

/// Map a requested concurrency onto the stored value. Missing, zero and
/// negative values fall back to [`DEFAULT_CONCURRENCY`]; values above
/// [`MAX_CONCURRENCY`] are rejected.
pub fn normalize_concurrency(requested: Option<i64>) -> Result<u32, ConcurrencyError> {
    match requested {
        Some(n) if n > 0 => validate_concurrency(n),
        _ => Ok(DEFAULT_CONCURRENCY),
    }
}

/// Accept an explicit worker count in `1..=MAX_CONCURRENCY`
pub fn validate_concurrency(requested: i64) -> Result<u32, ConcurrencyError> {
    u32::try_from(requested)
        .ok()
        .filter(|n| (1..=MAX_CONCURRENCY).contains(n))
        .ok_or(ConcurrencyError { value: requested })
}

/// Clamp a page size into `1..=MAX_PAGE_LIMIT`, defaulting when absent or zero
pub fn clamp_page_limit(requested: Option<u32>) -> u32 {
    match requested {
        None | Some(0) => DEFAULT_PAGE_LIMIT,
        Some(n) => n.min(MAX_PAGE_LIMIT),
    }
}

// ============================================================================
// Core Types
// ============================================================================

/// An isolated workload unit with its own queue and concurrency setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "concurrency_config")]
    pub concurrency: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, concurrency: u32) -> Self {
        let now = now_micros();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            concurrency,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Current time truncated to the microsecond resolution the stores keep
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A message persisted after successful consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Body published onto a tenant queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub tenant_id: Uuid,
    pub payload: serde_json::Value,
    /// Failed processing attempts so far; bumped each time the consumer
    /// republishes the message for another try
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn new(tenant_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            tenant_id,
            payload,
            attempts: 0,
        }
    }
}

/// One page of a tenant's messages in ascending creation order
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessagePage {
    pub data: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ============================================================================
// Cursor
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid cursor format: {value}")]
pub struct CursorError {
    pub value: String,
}

/// Encode a creation time as an opaque pagination cursor.
///
/// Microsecond precision matches the resolution of the stores, so a cursor
/// taken from a row sorts exactly at that row.
pub fn encode_cursor(created_at: &DateTime<Utc>) -> String {
    created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_cursor(cursor: &str) -> Result<DateTime<Utc>, CursorError> {
    DateTime::parse_from_rfc3339(cursor)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| CursorError { value: cursor.to_string() })
}

// ============================================================================
// Consumer Runtime Types
// ============================================================================

/// Lifecycle of a tenant consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped)
    }
}

/// Point-in-time copy of a consumer's observable fields
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConsumerSnapshot {
    pub tenant_id: Uuid,
    pub state: ConsumerState,
    pub capacity: u32,
    pub in_flight: u32,
    pub processed: u64,
    pub failed: u64,
    /// Messages given up on after exhausting their attempts
    pub dropped: u64,
}
