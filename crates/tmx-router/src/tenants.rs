//! TenantService - tenant lifecycle across the directory, the message
//! store, the broker and the consumer registry

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tmx_common::{normalize_concurrency, queue_name, validate_concurrency, ConsumerSnapshot, Tenant, PUBLISHER_CHANNEL};
use tmx_queue::BrokerClient;
use tmx_store::{MessageStore, TenantDirectory};

use crate::registry::ConsumerRegistry;
use crate::{Result, RouterError};

/// Outcome of starting consumers for stored tenants
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub started: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct TenantService {
    tenants: Arc<dyn TenantDirectory>,
    messages: Arc<dyn MessageStore>,
    registry: Arc<ConsumerRegistry>,
    client: Arc<BrokerClient>,
}

impl TenantService {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        messages: Arc<dyn MessageStore>,
        registry: Arc<ConsumerRegistry>,
        client: Arc<BrokerClient>,
    ) -> Self {
        Self {
            tenants,
            messages,
            registry,
            client,
        }
    }

    /// Create a tenant, its message partition and its running consumer.
    /// Missing or non-positive concurrency falls back to the default; values
    /// above `MAX_CONCURRENCY` are a validation error.
    pub async fn create_tenant(&self, name: &str, concurrency: Option<i64>) -> Result<Tenant> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RouterError::validation("tenant name must not be empty"));
        }

        let tenant = Tenant::new(name, normalize_concurrency(concurrency)?);
        self.tenants.insert_tenant(&tenant).await?;

        if let Err(e) = self.messages.create_partition(&tenant.id).await {
            self.discard_row(&tenant.id).await;
            return Err(e.into());
        }

        if let Err(e) = self.registry.create(tenant.id, tenant.concurrency).await {
            if let Err(drop_err) = self.messages.drop_partition(&tenant.id).await {
                warn!(tenant_id = %tenant.id, error = %drop_err, "Failed to drop partition while rolling back tenant");
            }
            self.discard_row(&tenant.id).await;
            return Err(e);
        }

        info!(
            tenant_id = %tenant.id,
            name = %tenant.name,
            concurrency = tenant.concurrency,
            "Tenant created"
        );
        Ok(tenant)
    }

    pub async fn get_tenant(&self, id: Uuid) -> Result<Tenant> {
        self.tenants
            .get_tenant(&id)
            .await?
            .ok_or_else(|| RouterError::not_found("Tenant", id))
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.list_tenants().await?)
    }

    /// Stop the tenant's consumer and remove its row. Partition and queue
    /// cleanup failures are logged and do not fail the call.
    pub async fn delete_tenant(&self, id: Uuid) -> Result<()> {
        self.get_tenant(id).await?;

        match self.registry.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if !self.tenants.delete_tenant(&id).await? {
            return Err(RouterError::not_found("Tenant", id));
        }

        if let Err(e) = self.messages.drop_partition(&id).await {
            warn!(tenant_id = %id, error = %e, "Failed to drop message partition");
        }

        if let Err(e) = self.delete_queue(&id).await {
            warn!(tenant_id = %id, error = %e, "Failed to delete tenant queue");
        }

        info!(tenant_id = %id, "Tenant deleted");
        Ok(())
    }

    /// Persist a new worker count and apply it to the live consumer, if any
    pub async fn update_concurrency(&self, id: Uuid, workers: i64) -> Result<Tenant> {
        let workers = validate_concurrency(workers)?;

        let tenant = self
            .tenants
            .update_concurrency(&id, workers)
            .await?
            .ok_or_else(|| RouterError::not_found("Tenant", id))?;

        match self.registry.resize(id, workers).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!(tenant_id = %id, "No live consumer, concurrency applies on next start");
            }
            Err(e) => return Err(e),
        }

        Ok(tenant)
    }

    /// Start consumers for every stored tenant that has none
    pub async fn restore_consumers(&self) -> Result<RestoreSummary> {
        let tenants = self.tenants.list_tenants().await?;
        let mut summary = RestoreSummary::default();

        for tenant in tenants {
            if self.registry.contains(tenant.id).await {
                summary.skipped += 1;
                continue;
            }
            match self.registry.create(tenant.id, tenant.concurrency).await {
                Ok(_) => summary.started += 1,
                Err(e) => {
                    warn!(tenant_id = %tenant.id, error = %e, "Failed to restore consumer");
                    summary.failed += 1;
                }
            }
        }

        info!(
            started = summary.started,
            skipped = summary.skipped,
            failed = summary.failed,
            "Tenant consumers restored"
        );
        Ok(summary)
    }

    pub async fn consumer_status(&self, id: Uuid) -> Result<ConsumerSnapshot> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| RouterError::not_found("Consumer", id))
    }

    async fn delete_queue(&self, id: &Uuid) -> Result<()> {
        let channel = self.client.open_channel(PUBLISHER_CHANNEL).await?;
        self.client.delete_queue(channel.as_ref(), &queue_name(id)).await?;
        Ok(())
    }

    async fn discard_row(&self, id: &Uuid) {
        if let Err(e) = self.tenants.delete_tenant(id).await {
            warn!(tenant_id = %id, error = %e, "Failed to remove tenant row while rolling back");
        }
    }
}
