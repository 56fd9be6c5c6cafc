//! ConsumerRegistry - the set of live tenant consumers
//!
//! All lifecycle changes (create, delete, resize) take the write lock, so a
//! tenant never has two live consumers and a consumer is only visible after
//! its queue has been declared. Callers only ever see [`ConsumerSnapshot`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use tmx_common::{channel_name, ConsumerSnapshot};
use tmx_queue::BrokerClient;

use crate::consumer::{ConsumerSettings, MessageProcessor, TenantConsumer};
use crate::{Result, RouterError};

pub struct ConsumerRegistry {
    client: Arc<BrokerClient>,
    processor: Arc<dyn MessageProcessor>,
    settings: ConsumerSettings,
    consumers: RwLock<HashMap<Uuid, Arc<TenantConsumer>>>,
    /// Deleted consumers whose in-flight work may still be finishing
    retired: Mutex<Vec<Arc<TenantConsumer>>>,
    running: AtomicBool,
}

impl ConsumerRegistry {
    pub fn new(
        client: Arc<BrokerClient>,
        processor: Arc<dyn MessageProcessor>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            client,
            processor,
            settings,
            consumers: RwLock::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    /// Start and register a consumer for `tenant_id`
    pub async fn create(&self, tenant_id: Uuid, capacity: u32) -> Result<ConsumerSnapshot> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::internal("consumer registry is shut down"));
        }

        let mut consumers = self.consumers.write().await;

        if let Some(existing) = consumers.get(&tenant_id) {
            if !existing.state().is_terminal() {
                return Err(RouterError::already_exists("Consumer", tenant_id));
            }
        }

        self.start_locked(&mut consumers, tenant_id, capacity).await
    }

    /// Start a consumer into the locked map, replacing a stopped entry
    async fn start_locked(
        &self,
        consumers: &mut HashMap<Uuid, Arc<TenantConsumer>>,
        tenant_id: Uuid,
        capacity: u32,
    ) -> Result<ConsumerSnapshot> {
        if consumers.remove(&tenant_id).is_some() {
            // Its stream ended on its own; make room for a fresh one.
            warn!(tenant_id = %tenant_id, "Replacing stopped consumer");
            if let Err(e) = self.client.close_channel(&channel_name(&tenant_id)).await {
                warn!(tenant_id = %tenant_id, error = %e, "Failed to close stale consumer channel");
            }
        }

        let started = TenantConsumer::start(
            tenant_id,
            capacity,
            &self.client,
            self.processor.clone(),
            &self.settings,
        )
        .await;

        match started {
            Ok(consumer) => {
                let snapshot = consumer.snapshot();
                consumers.insert(tenant_id, consumer);
                Ok(snapshot)
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Failed to start consumer");
                if let Err(close_err) = self.client.close_channel(&channel_name(&tenant_id)).await {
                    warn!(tenant_id = %tenant_id, error = %close_err, "Failed to close channel after start failure");
                }
                Err(e)
            }
        }
    }

    /// Signal the consumer to stop, close its channel and unregister it.
    ///
    /// Does not wait for in-flight work. Deliveries that can no longer be
    /// acknowledged on the closed channel are redelivered by the broker.
    pub async fn delete(&self, tenant_id: Uuid) -> Result<()> {
        let mut consumers = self.consumers.write().await;

        let consumer = consumers
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| RouterError::not_found("Consumer", tenant_id))?;

        consumer.stop();
        if let Err(e) = self.client.close_channel(consumer.channel_name()).await {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to close consumer channel");
        }
        consumers.remove(&tenant_id);
        drop(consumers);

        info!(tenant_id = %tenant_id, in_flight = consumer.snapshot().in_flight, "Consumer removed");
        self.retired.lock().push(consumer);
        self.cleanup_retired();
        Ok(())
    }

    /// Change the worker concurrency of a registered consumer. A consumer
    /// whose stream has already ended is restarted at the new capacity.
    pub async fn resize(&self, tenant_id: Uuid, capacity: u32) -> Result<ConsumerSnapshot> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::internal("consumer registry is shut down"));
        }

        let mut consumers = self.consumers.write().await;

        let consumer = consumers
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| RouterError::not_found("Consumer", tenant_id))?;

        if consumer.state().is_terminal() {
            return self.start_locked(&mut consumers, tenant_id, capacity).await;
        }

        consumer.resize(capacity);
        Ok(consumer.snapshot())
    }

    pub async fn get(&self, tenant_id: Uuid) -> Option<ConsumerSnapshot> {
        self.consumers.read().await.get(&tenant_id).map(|c| c.snapshot())
    }

    pub async fn contains(&self, tenant_id: Uuid) -> bool {
        self.consumers.read().await.contains_key(&tenant_id)
    }

    /// Snapshots of every registered consumer, ordered by tenant id
    pub async fn snapshots(&self) -> Vec<ConsumerSnapshot> {
        let mut snapshots: Vec<_> = self
            .consumers
            .read()
            .await
            .values()
            .map(|c| c.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.tenant_id);
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }

    /// Forget retired consumers that have fully stopped. Returns how many
    /// are still draining.
    pub fn cleanup_retired(&self) -> usize {
        let mut retired = self.retired.lock();
        retired.retain(|c| !c.state().is_terminal());
        retired.len()
    }

    /// Wait for every retired consumer to finish draining
    pub async fn wait_retired(&self, timeout: Duration) -> bool {
        let pending: Vec<_> = self.retired.lock().clone();
        let drained = Self::wait_all(&pending, timeout).await;
        self.cleanup_retired();
        drained
    }

    /// Stop every consumer, wait up to `timeout` for in-flight work, then
    /// close their channels. No consumers can be created afterwards.
    pub async fn shutdown(&self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);

        let consumers: Vec<_> = {
            let mut map = self.consumers.write().await;
            map.drain().map(|(_, consumer)| consumer).collect()
        };

        info!(consumers = consumers.len(), "Shutting down consumer registry");

        for consumer in &consumers {
            consumer.stop();
        }

        let mut waiting = consumers.clone();
        waiting.extend(self.retired.lock().drain(..));

        if !Self::wait_all(&waiting, timeout).await {
            warn!("Consumers still draining at shutdown timeout, remaining deliveries will be redelivered");
        }

        for consumer in &consumers {
            if let Err(e) = self.client.close_channel(consumer.channel_name()).await {
                warn!(tenant_id = %consumer.tenant_id(), error = %e, "Failed to close consumer channel");
            }
        }

        info!("Consumer registry shutdown complete");
    }

    async fn wait_all(consumers: &[Arc<TenantConsumer>], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut all_stopped = true;

        for consumer in consumers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !consumer.wait_stopped(remaining).await {
                warn!(
                    tenant_id = %consumer.tenant_id(),
                    in_flight = consumer.snapshot().in_flight,
                    "Consumer did not stop in time"
                );
                all_stopped = false;
            }
        }

        all_stopped
    }
}
