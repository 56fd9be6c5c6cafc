use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tmx_common::{now_micros, Message, Tenant};
use tracing::debug;
use uuid::Uuid;

use crate::repository::{from_micros, CreationClock, MessageStore, TenantDirectory};
use crate::{Result, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    concurrency_config INTEGER NOT NULL DEFAULT 3,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_tenant_created ON messages (tenant_id, created_at);

CREATE TABLE IF NOT EXISTS message_partitions (
    tenant_id TEXT PRIMARY KEY
);
"#;

/// SQLite backend. Timestamps are stored as integer microseconds and ids as
/// text. SQLite has no table partitioning: a partition is a row in
/// `message_partitions`, inserts are rejected without one, and dropping it
/// deletes the tenant's messages.
pub struct SqliteStore {
    pool: SqlitePool,
    clock: CreationClock,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: CreationClock::new(),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::invalid_row(format!("bad uuid {}: {}", raw, e)))
}

fn tenant_from_row(row: &SqliteRow) -> Result<Tenant> {
    let id: String = row.try_get("id")?;
    let concurrency: i64 = row.try_get("concurrency_config")?;
    let concurrency = u32::try_from(concurrency)
        .ok()
        .filter(|c| *c >= 1)
        .ok_or_else(|| StoreError::invalid_row(format!("concurrency_config {} out of range", concurrency)))?;
    Ok(Tenant {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        concurrency,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let payload: String = row.try_get("payload")?;
    Ok(Message {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        payload: serde_json::from_str(&payload)?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl TenantDirectory for SqliteStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name, concurrency_config, created_at, updated_at) VALUES (?, ?, ?, ?, ?)"
        )
        .bind(tenant.id.to_string())
        .bind(&tenant.name)
        .bind(tenant.concurrency as i64)
        .bind(tenant.created_at.timestamp_micros())
        .bind(tenant.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, id: &Uuid) -> Result<Option<Tenant>> {
        let row = sqlx::query(
            "SELECT id, name, concurrency_config, created_at, updated_at FROM tenants WHERE id = ?"
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query(
            "SELECT id, name, concurrency_config, created_at, updated_at FROM tenants ORDER BY created_at, id"
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tenant_from_row).collect()
    }

    async fn update_concurrency(&self, id: &Uuid, concurrency: u32) -> Result<Option<Tenant>> {
        let result = sqlx::query("UPDATE tenants SET concurrency_config = ?, updated_at = ? WHERE id = ?")
            .bind(concurrency as i64)
            .bind(now_micros().timestamp_micros())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_tenant(id).await
    }

    async fn delete_tenant(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create_partition(&self, tenant_id: &Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO message_partitions (tenant_id) VALUES (?)")
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;
        debug!(tenant_id = %tenant_id, "Message partition registered");
        Ok(())
    }

    async fn drop_partition(&self, tenant_id: &Uuid) -> Result<()> {
        // Unregister first: an insert racing this call either lands before
        // and is deleted below, or is rejected.
        sqlx::query("DELETE FROM message_partitions WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;

        let result = sqlx::query("DELETE FROM messages WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;
        self.clock.forget(tenant_id);
        debug!(tenant_id = %tenant_id, removed = result.rows_affected(), "Removed tenant messages");
        Ok(())
    }

    async fn insert_message(&self, tenant_id: &Uuid, payload: &serde_json::Value) -> Result<Message> {
        let micros = self.clock.next_micros(tenant_id);
        let message = Message {
            id: Uuid::new_v4(),
            tenant_id: *tenant_id,
            payload: payload.clone(),
            created_at: from_micros(micros)?,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, tenant_id, payload, created_at)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM message_partitions WHERE tenant_id = ?)
            "#
        )
        .bind(message.id.to_string())
        .bind(tenant_id.to_string())
        .bind(serde_json::to_string(payload)?)
        .bind(micros)
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PartitionNotFound(*tenant_id));
        }
        Ok(message)
    }

    async fn fetch_messages(
        &self,
        tenant_id: &Uuid,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let after = after.map(|ts| ts.timestamp_micros()).unwrap_or(i64::MIN);

        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, payload, created_at
            FROM messages
            WHERE tenant_id = ? AND created_at > ?
            ORDER BY created_at ASC
            LIMIT ?
            "#
        )
        .bind(tenant_id.to_string())
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn count_messages(&self, tenant_id: &Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE tenant_id = ?")
            .bind(tenant_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_tenant_crud() {
        let store = store().await;
        let tenant = Tenant::new("acme", 4);

        store.insert_tenant(&tenant).await.unwrap();
        assert_eq!(store.get_tenant(&tenant.id).await.unwrap(), Some(tenant.clone()));

        let updated = store.update_concurrency(&tenant.id, 9).await.unwrap().unwrap();
        assert_eq!(updated.concurrency, 9);
        assert_eq!(updated.created_at, tenant.created_at);

        assert!(store.delete_tenant(&tenant.id).await.unwrap());
        assert!(!store.delete_tenant(&tenant.id).await.unwrap());
        assert!(store.get_tenant(&tenant.id).await.unwrap().is_none());
        assert!(store.update_concurrency(&tenant.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_are_ordered_and_scoped_to_tenant() {
        let store = store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create_partition(&a).await.unwrap();
        store.create_partition(&b).await.unwrap();

        for i in 0..5 {
            store.insert_message(&a, &json!({ "n": i })).await.unwrap();
        }
        store.insert_message(&b, &json!({ "n": 99 })).await.unwrap();

        let all = store.fetch_messages(&a, None, 100).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].created_at < w[1].created_at));
        assert_eq!(all[0].payload, json!({ "n": 0 }));

        let rest = store.fetch_messages(&a, Some(all[1].created_at), 100).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].id, all[2].id);

        assert_eq!(store.count_messages(&a).await.unwrap(), 5);
        assert_eq!(store.count_messages(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_partition_removes_only_that_tenant() {
        let store = store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.create_partition(&a).await.unwrap();
        store.create_partition(&b).await.unwrap();
        store.insert_message(&a, &json!({})).await.unwrap();
        store.insert_message(&b, &json!({})).await.unwrap();

        store.drop_partition(&a).await.unwrap();

        assert_eq!(store.count_messages(&a).await.unwrap(), 0);
        assert_eq!(store.count_messages(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_after_drop_partition_is_rejected() {
        let store = store().await;
        let tenant = Uuid::new_v4();

        let err = store.insert_message(&tenant, &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::PartitionNotFound(id) if id == tenant));

        store.create_partition(&tenant).await.unwrap();
        store.create_partition(&tenant).await.unwrap();
        store.insert_message(&tenant, &json!({ "n": 1 })).await.unwrap();

        store.drop_partition(&tenant).await.unwrap();
        let err = store.insert_message(&tenant, &json!({ "n": 2 })).await.unwrap_err();
        assert!(matches!(err, StoreError::PartitionNotFound(_)));
        assert_eq!(store.count_messages(&tenant).await.unwrap(), 0);
    }
}
