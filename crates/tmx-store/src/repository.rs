use std::collections::HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tmx_common::{Message, Tenant};
use uuid::Uuid;

use crate::{Result, StoreError};

/// Tenant rows: identity, name and configured concurrency
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<()>;

    async fn get_tenant(&self, id: &Uuid) -> Result<Option<Tenant>>;

    /// All tenants, oldest first
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    /// Returns the updated row, or `None` when the tenant does not exist
    async fn update_concurrency(&self, id: &Uuid, concurrency: u32) -> Result<Option<Tenant>>;

    /// Returns false when there was no row to delete
    async fn delete_tenant(&self, id: &Uuid) -> Result<bool>;
}

/// Consumed messages, partitioned per tenant
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_partition(&self, tenant_id: &Uuid) -> Result<()>;

    async fn drop_partition(&self, tenant_id: &Uuid) -> Result<()>;

    /// Persist a payload. `created_at` is assigned by the store and strictly
    /// increases within a tenant.
    async fn insert_message(&self, tenant_id: &Uuid, payload: &serde_json::Value) -> Result<Message>;

    /// Up to `limit` messages created strictly after `after`, ascending
    async fn fetch_messages(
        &self,
        tenant_id: &Uuid,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>>;

    async fn count_messages(&self, tenant_id: &Uuid) -> Result<u64>;
}

/// Hands out per-tenant creation timestamps in microseconds, each one at
/// least one microsecond after the previous for that tenant.
///
/// Ordering holds within one process; a restarted process resumes from the
/// wall clock.
#[derive(Default)]
pub struct CreationClock {
    last: Mutex<HashMap<Uuid, i64>>,
}

impl CreationClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_micros(&self, tenant_id: &Uuid) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut last = self.last.lock();
        let entry = last.entry(*tenant_id).or_insert(i64::MIN);
        let stamp = now.max(entry.saturating_add(1));
        *entry = stamp;
        stamp
    }

    pub fn next(&self, tenant_id: &Uuid) -> Result<DateTime<Utc>> {
        from_micros(self.next_micros(tenant_id))
    }

    pub fn forget(&self, tenant_id: &Uuid) {
        self.last.lock().remove(tenant_id);
    }
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::invalid_row(format!("timestamp out of range: {}", micros)))
}
