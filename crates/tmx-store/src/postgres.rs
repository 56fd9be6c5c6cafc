use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tmx_common::{now_micros, partition_name, Message, Tenant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::repository::{CreationClock, MessageStore, TenantDirectory};
use crate::{Result, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    concurrency_config INTEGER NOT NULL DEFAULT 3,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS messages (
    id UUID NOT NULL,
    tenant_id UUID NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, id)
) PARTITION BY LIST (tenant_id);

CREATE INDEX IF NOT EXISTS idx_messages_tenant_created ON messages (tenant_id, created_at);
"#;

pub struct PostgresStore {
    pool: PgPool,
    clock: CreationClock,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: CreationClock::new(),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("PostgreSQL schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn concurrency_column(concurrency: u32) -> Result<i32> {
    i32::try_from(concurrency).map_err(|_| StoreError::OutOfRange {
        field: "concurrency_config",
        value: concurrency as i64,
    })
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    let concurrency: i32 = row.try_get("concurrency_config")?;
    let concurrency = u32::try_from(concurrency)
        .ok()
        .filter(|c| *c >= 1)
        .ok_or_else(|| StoreError::invalid_row(format!("concurrency_config {} is not positive", concurrency)))?;
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        concurrency,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message> {
    let payload: Json<serde_json::Value> = row.try_get("payload")?;
    Ok(Message {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        payload: payload.0,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl TenantDirectory for PostgresStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenants (id, name, concurrency_config, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)"
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(concurrency_column(tenant.concurrency)?)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, id: &Uuid) -> Result<Option<Tenant>> {
        let row = sqlx::query(
            "SELECT id, name, concurrency_config, created_at, updated_at FROM tenants WHERE id = $1"
        )
        .bind(id)
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
        let row = sqlx::query(
            r#"
            UPDATE tenants
            SET concurrency_config = $1, updated_at = $2
            WHERE id = $3
            RETURNING id, name, concurrency_config, created_at, updated_at
            "#
        )
        .bind(concurrency_column(concurrency)?)
        .bind(now_micros())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn delete_tenant(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn create_partition(&self, tenant_id: &Uuid) -> Result<()> {
        // DDL takes no bind parameters; both names derive from a parsed Uuid.
        let partition = partition_name(tenant_id);
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF messages FOR VALUES IN ('{}')",
            partition, tenant_id
        );
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        debug!(tenant_id = %tenant_id, partition = %partition, "Created message partition");
        Ok(())
    }

    async fn drop_partition(&self, tenant_id: &Uuid) -> Result<()> {
        let partition = partition_name(tenant_id);
        let ddl = format!("DROP TABLE IF EXISTS {}", partition);
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        self.clock.forget(tenant_id);
        debug!(tenant_id = %tenant_id, partition = %partition, "Dropped message partition");
        Ok(())
    }

    async fn insert_message(&self, tenant_id: &Uuid, payload: &serde_json::Value) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            tenant_id: *tenant_id,
            payload: payload.clone(),
            created_at: self.clock.next(tenant_id)?,
        };

        sqlx::query("INSERT INTO messages (id, tenant_id, payload, created_at) VALUES ($1, $2, $3, $4)")
            .bind(message.id)
            .bind(message.tenant_id)
            .bind(Json(&message.payload))
            .bind(message.created_at)
            .execute(&self.pool)
            .await?;

        Ok(message)
    }

    async fn fetch_messages(
        &self,
        tenant_id: &Uuid,
        after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, payload, created_at
            FROM messages
            WHERE tenant_id = $1 AND ($2::timestamptz IS NULL OR created_at > $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#
        )
        .bind(tenant_id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn count_messages(&self, tenant_id: &Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
