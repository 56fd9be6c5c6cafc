//! MessageService - publish path and paginated reads

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use tmx_common::{
    clamp_page_limit, decode_cursor, encode_cursor, queue_name, MessagePage, QueuedMessage,
    PUBLISHER_CHANNEL,
};
use tmx_queue::{BrokerClient, QueueError};
use tmx_store::{MessageStore, TenantDirectory};

use crate::{Result, RouterError};

pub struct MessageService {
    tenants: Arc<dyn TenantDirectory>,
    messages: Arc<dyn MessageStore>,
    client: Arc<BrokerClient>,
}

impl MessageService {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        messages: Arc<dyn MessageStore>,
        client: Arc<BrokerClient>,
    ) -> Self {
        Self {
            tenants,
            messages,
            client,
        }
    }

    /// Enqueue a payload for a tenant on the shared publisher channel.
    /// Works whether or not the tenant's consumer is running.
    pub async fn publish(&self, tenant_id: Uuid, payload: serde_json::Value) -> Result<()> {
        if !payload.is_object() {
            return Err(RouterError::validation("payload must be a JSON object"));
        }
        self.ensure_tenant(tenant_id).await?;

        let channel = self.client.open_channel(PUBLISHER_CHANNEL).await?;
        let queue = queue_name(&tenant_id);
        self.client.declare_queue(channel.as_ref(), &queue).await?;

        let body = serde_json::to_vec(&QueuedMessage::new(tenant_id, payload)).map_err(QueueError::from)?;
        channel.publish(&queue, &body).await?;

        metrics::counter!("tmx_messages_published_total").increment(1);
        debug!(tenant_id = %tenant_id, queue = %queue, bytes = body.len(), "Message published");
        Ok(())
    }

    /// One page of a tenant's messages after `cursor`, oldest first
    pub async fn get_messages(
        &self,
        tenant_id: Uuid,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<MessagePage> {
        let limit = clamp_page_limit(limit);
        let after = cursor
            .filter(|c| !c.is_empty())
            .map(decode_cursor)
            .transpose()?;
        self.ensure_tenant(tenant_id).await?;

        let mut data = self
            .messages
            .fetch_messages(&tenant_id, after, limit + 1)
            .await?;

        let next_cursor = if data.len() > limit as usize {
            data.truncate(limit as usize);
            data.last().map(|m| encode_cursor(&m.created_at))
        } else {
            None
        };

        Ok(MessagePage { data, next_cursor })
    }

    pub async fn count_messages(&self, tenant_id: Uuid) -> Result<u64> {
        self.ensure_tenant(tenant_id).await?;
        Ok(self.messages.count_messages(&tenant_id).await?)
    }

    async fn ensure_tenant(&self, tenant_id: Uuid) -> Result<()> {
        match self.tenants.get_tenant(&tenant_id).await? {
            Some(_) => Ok(()),
            None => Err(RouterError::not_found("Tenant", tenant_id)),
        }
    }
}
