//! TenantConsumer - dispatch loop for one tenant queue
//!
//! One task per consumer pulls deliveries from the tenant's queue and hands
//! each one to a short-lived processing task once a [`WorkerPool`] permit is
//! available. The permit travels with the task and is released on every exit
//! path, panics included.
//!
//! A failed or panicked message is republished to the tenant queue with its
//! attempt count bumped, after a delay that grows with each attempt. Once
//! `max_attempts` is reached it is acked and dropped.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tmx_common::{channel_name, consumer_tag, queue_name, ConsumerSnapshot, ConsumerState, QueuedMessage};
use tmx_queue::{BrokerChannel, BrokerClient, Delivery, DeliveryStream};
use tmx_store::MessageStore;

use crate::pool::{PoolPermit, WorkerPool};
use crate::{Result, RouterError};

/// Handles the body of one delivery. An error or panic schedules a retry.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, tenant_id: &Uuid, body: &[u8]) -> Result<()>;
}

/// Decodes a queued message and persists its payload
pub struct StoreProcessor {
    store: Arc<dyn MessageStore>,
}

impl StoreProcessor {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageProcessor for StoreProcessor {
    async fn process(&self, tenant_id: &Uuid, body: &[u8]) -> Result<()> {
        let queued: QueuedMessage = serde_json::from_slice(body)
            .map_err(|e| RouterError::processing(format!("malformed queued message: {}", e)))?;

        if queued.tenant_id != *tenant_id {
            return Err(RouterError::processing(format!(
                "message addressed to tenant {} arrived on the queue of {}",
                queued.tenant_id, tenant_id
            )));
        }

        let message = self.store.insert_message(tenant_id, &queued.payload).await?;
        debug!(tenant_id = %tenant_id, message_id = %message.id, "Message persisted");
        Ok(())
    }
}

/// Per-consumer tuning shared by every tenant
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Broker prefetch for the tenant channel; zero leaves it unset
    pub prefetch: u16,
    /// Base pause before a failed message is retried, multiplied by the
    /// attempt number
    pub retry_delay: Duration,
    /// Processing attempts per message, the first included; at least 1
    pub max_attempts: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 0,
            retry_delay: Duration::from_millis(100),
            max_attempts: 5,
        }
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Shared between the dispatch loop and every processing task it spawns
#[derive(Clone)]
struct Dispatch {
    tenant_id: Uuid,
    label: String,
    pool: WorkerPool,
    processor: Arc<dyn MessageProcessor>,
    counters: Arc<Counters>,
    state: Arc<watch::Sender<ConsumerState>>,
    /// Tenant channel, used to republish retries
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    retry_delay: Duration,
    max_attempts: u32,
}

pub struct TenantConsumer {
    tenant_id: Uuid,
    channel_name: String,
    pool: WorkerPool,
    counters: Arc<Counters>,
    state: Arc<watch::Sender<ConsumerState>>,
    stop_tx: broadcast::Sender<()>,
}

impl TenantConsumer {
    /// Open the tenant channel, declare its queue, subscribe and spawn the
    /// dispatch loop. On error the channel may be left open in the client's
    /// cache; the caller decides whether to close it.
    pub async fn start(
        tenant_id: Uuid,
        capacity: u32,
        client: &BrokerClient,
        processor: Arc<dyn MessageProcessor>,
        settings: &ConsumerSettings,
    ) -> Result<Arc<Self>> {
        let channel_name = channel_name(&tenant_id);
        let queue = queue_name(&tenant_id);
        let (state, _) = watch::channel(ConsumerState::Starting);

        let channel = client.open_channel(&channel_name).await?;
        client.declare_queue(channel.as_ref(), &queue).await?;
        if settings.prefetch > 0 {
            channel.set_prefetch(settings.prefetch).await?;
        }
        let deliveries = channel.consume(&queue, &consumer_tag(&tenant_id)).await?;

        let pool = WorkerPool::new(capacity);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let consumer = Arc::new(Self {
            tenant_id,
            channel_name,
            pool: pool.clone(),
            counters: Arc::new(Counters::default()),
            state: Arc::new(state),
            stop_tx,
        });

        let dispatch = Dispatch {
            tenant_id,
            label: tenant_id.to_string(),
            pool,
            processor,
            counters: consumer.counters.clone(),
            state: consumer.state.clone(),
            channel,
            queue: queue.clone(),
            retry_delay: settings.retry_delay,
            max_attempts: settings.max_attempts.max(1),
        };

        consumer.state.send_replace(ConsumerState::Running);
        metrics::gauge!("tmx_active_consumers").increment(1.0);
        tokio::spawn(dispatch.run(deliveries, stop_rx));

        info!(
            tenant_id = %tenant_id,
            queue = %queue,
            capacity = consumer.pool.capacity(),
            "Tenant consumer started"
        );

        Ok(consumer)
    }

    /// Ask the dispatch loop to stop. Never blocks.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| match state {
            ConsumerState::Starting | ConsumerState::Running => {
                *state = ConsumerState::Draining;
                true
            }
            _ => false,
        });
        // No receiver means the loop has already exited.
        let _ = self.stop_tx.send(());
    }

    /// Change worker concurrency for subsequent admissions
    pub fn resize(&self, capacity: u32) {
        let previous = self.pool.resize(capacity);
        info!(
            tenant_id = %self.tenant_id,
            previous = previous,
            capacity = self.pool.capacity(),
            in_flight = self.pool.in_flight(),
            "Consumer concurrency updated"
        );
    }

    /// Wait for the consumer to reach `Stopped`. Returns false on timeout.
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let stopped = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal())).await;
        matches!(stopped, Ok(Ok(_)))
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            tenant_id: self.tenant_id,
            state: self.state(),
            capacity: self.pool.capacity(),
            in_flight: self.pool.in_flight(),
            processed: self.counters.processed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
        }
    }
}

impl Dispatch {
    async fn run(self, mut deliveries: DeliveryStream, mut stop_rx: broadcast::Receiver<()>) {
        debug!(tenant_id = %self.tenant_id, "Dispatch loop running");

        loop {
            let delivery = tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(tenant_id = %self.tenant_id, "Stop signal received");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(tenant_id = %self.tenant_id, error = %e, "Delivery stream failed, stopping consumer");
                        break;
                    }
                    None => {
                        info!(tenant_id = %self.tenant_id, "Delivery stream ended, stopping consumer");
                        break;
                    }
                }
            };

            let permit = tokio::select! {
                _ = stop_rx.recv() => {
                    // Received but never admitted: hand it back to the broker.
                    if let Err(e) = delivery.nack(true).await {
                        debug!(tenant_id = %self.tenant_id, error = %e, "Could not return unadmitted delivery");
                    }
                    break;
                }
                permit = self.pool.acquire() => permit,
            };

            self.spawn_processing(delivery, permit);
        }

        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Stopped {
                return false;
            }
            *state = ConsumerState::Draining;
            true
        });
        drop(deliveries);

        self.pool.wait_idle().await;

        self.state.send_replace(ConsumerState::Stopped);
        metrics::gauge!("tmx_active_consumers").decrement(1.0);
        info!(
            tenant_id = %self.tenant_id,
            processed = self.counters.processed.load(Ordering::SeqCst),
            failed = self.counters.failed.load(Ordering::SeqCst),
            "Tenant consumer stopped"
        );
    }

    fn spawn_processing(&self, delivery: Box<dyn Delivery>, permit: PoolPermit) {
        let ctx = self.clone();

        tokio::spawn(async move {
            let _permit = permit;

            let outcome = AssertUnwindSafe(ctx.processor.process(&ctx.tenant_id, delivery.body()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    ctx.counters.processed.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!("tmx_messages_processed_total", "tenant_id" => ctx.label.clone())
                        .increment(1);
                    if let Err(e) = delivery.ack().await {
                        // The broker redelivers anything left unacknowledged.
                        warn!(
                            tenant_id = %ctx.tenant_id,
                            delivery_tag = delivery.delivery_tag(),
                            error = %e,
                            "Failed to ack delivery"
                        );
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        tenant_id = %ctx.tenant_id,
                        delivery_tag = delivery.delivery_tag(),
                        redelivered = delivery.redelivered(),
                        error = %e,
                        "Processing failed"
                    );
                    ctx.retry_or_drop(delivery.as_ref()).await;
                }
                Err(_) => {
                    error!(
                        tenant_id = %ctx.tenant_id,
                        delivery_tag = delivery.delivery_tag(),
                        "Processing task panicked"
                    );
                    ctx.retry_or_drop(delivery.as_ref()).await;
                }
            }
        });
    }

    fn record_failure(&self) {
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("tmx_messages_failed_total", "tenant_id" => self.label.clone()).increment(1);
    }

    /// Shared by the error and panic paths: back off, then republish the
    /// message with one more attempt recorded, or drop it at the limit.
    async fn retry_or_drop(&self, delivery: &dyn Delivery) {
        self.record_failure();

        let mut queued: QueuedMessage = match serde_json::from_slice(delivery.body()) {
            Ok(queued) => queued,
            Err(e) => {
                // No attempt count to carry, and it will never decode.
                self.drop_delivery(delivery, 1, &format!("undecodable body: {}", e)).await;
                return;
            }
        };

        queued.attempts = queued.attempts.saturating_add(1);
        if queued.attempts >= self.max_attempts {
            self.drop_delivery(delivery, queued.attempts, "retry limit reached").await;
            return;
        }

        tokio::time::sleep(self.retry_delay.saturating_mul(queued.attempts)).await;

        let republished = match serde_json::to_vec(&queued) {
            Ok(body) => self.channel.publish(&self.queue, &body).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match republished {
            Ok(()) => {
                debug!(
                    tenant_id = %self.tenant_id,
                    attempts = queued.attempts,
                    "Failed message republished for retry"
                );
                if let Err(e) = delivery.ack().await {
                    warn!(
                        tenant_id = %self.tenant_id,
                        delivery_tag = delivery.delivery_tag(),
                        error = %e,
                        "Failed to ack retried delivery, it may be processed twice"
                    );
                }
            }
            Err(e) => {
                warn!(
                    tenant_id = %self.tenant_id,
                    error = %e,
                    "Could not republish failed message, requeueing it unchanged"
                );
                self.requeue(delivery).await;
            }
        }
    }

    async fn drop_delivery(&self, delivery: &dyn Delivery, attempts: u32, reason: &str) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("tmx_messages_dropped_total", "tenant_id" => self.label.clone()).increment(1);
        warn!(
            tenant_id = %self.tenant_id,
            delivery_tag = delivery.delivery_tag(),
            attempts = attempts,
            reason = reason,
            "Dropping message"
        );
        if let Err(e) = delivery.ack().await {
            warn!(
                tenant_id = %self.tenant_id,
                delivery_tag = delivery.delivery_tag(),
                error = %e,
                "Failed to ack dropped delivery"
            );
        }
    }

    async fn requeue(&self, delivery: &dyn Delivery) {
        if let Err(e) = delivery.nack(true).await {
            warn!(
                tenant_id = %self.tenant_id,
                delivery_tag = delivery.delivery_tag(),
                error = %e,
                "Failed to nack delivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tmx_queue::MemoryBroker;

    struct RecordingProcessor {
        seen: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl MessageProcessor for RecordingProcessor {
        async fn process(&self, _tenant_id: &Uuid, body: &[u8]) -> Result<()> {
            let queued: QueuedMessage = serde_json::from_slice(body)
                .map_err(|e| RouterError::processing(e.to_string()))?;
            self.seen.lock().push(queued.payload);
            Ok(())
        }
    }

    #[derive(Default)]
    struct PanickingProcessor {
        calls: AtomicU64,
    }

    #[async_trait]
    impl MessageProcessor for PanickingProcessor {
        async fn process(&self, _tenant_id: &Uuid, _body: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("processor blew up");
        }
    }

    #[derive(Default)]
    struct FailingProcessor {
        calls: AtomicU64,
    }

    #[async_trait]
    impl MessageProcessor for FailingProcessor {
        async fn process(&self, _tenant_id: &Uuid, _body: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RouterError::processing("always fails"))
        }
    }

    async fn publish(broker: &MemoryBroker, tenant_id: Uuid, payload: serde_json::Value) {
        let channel = tmx_queue::BrokerConnection::create_channel(broker).await.unwrap();
        let queue = queue_name(&tenant_id);
        channel.declare_queue(&queue).await.unwrap();
        let body = serde_json::to_vec(&QueuedMessage::new(tenant_id, payload)).unwrap();
        channel.publish(&queue, &body).await.unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_consumer_processes_and_stops() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()));
        let tenant_id = Uuid::new_v4();
        let processor = Arc::new(RecordingProcessor { seen: Mutex::new(Vec::new()) });

        let consumer = TenantConsumer::start(tenant_id, 2, &client, processor.clone(), &ConsumerSettings::default())
            .await
            .unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);

        publish(&broker, tenant_id, serde_json::json!({ "n": 1 })).await;
        eventually(|| consumer.snapshot().processed == 1).await;
        eventually(|| broker.stats().acked == 1).await;

        consumer.stop();
        assert!(consumer.wait_stopped(Duration::from_secs(1)).await);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(processor.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_retried() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()));
        let tenant_id = Uuid::new_v4();
        let settings = ConsumerSettings {
            prefetch: 0,
            retry_delay: Duration::from_millis(10),
            max_attempts: 3,
        };
        let processor = Arc::new(PanickingProcessor::default());

        let consumer = TenantConsumer::start(tenant_id, 1, &client, processor.clone(), &settings)
            .await
            .unwrap();

        publish(&broker, tenant_id, serde_json::json!({})).await;
        eventually(|| consumer.snapshot().dropped == 1).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(consumer.snapshot().failed, 3);
        assert_eq!(consumer.state(), ConsumerState::Running);
        consumer.stop();
        assert!(consumer.wait_stopped(Duration::from_secs(2)).await);
        assert_eq!(consumer.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_panicking_message_backs_off() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()));
        let tenant_id = Uuid::new_v4();
        let settings = ConsumerSettings {
            prefetch: 0,
            retry_delay: Duration::from_millis(50),
            max_attempts: 1_000,
        };
        let processor = Arc::new(PanickingProcessor::default());

        let consumer = TenantConsumer::start(tenant_id, 1, &client, processor.clone(), &settings)
            .await
            .unwrap();

        publish(&broker, tenant_id, serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Delays of 50, 100, 150 and 200ms fit at most five tries in the window.
        let calls = processor.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "message was never retried");
        assert!(calls <= 6, "{} tries in 500ms, retries are not backing off", calls);
        assert_eq!(broker.stats().requeued, 0);

        consumer.stop();
        assert!(consumer.wait_stopped(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_failing_message_stops_after_max_attempts() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()));
        let tenant_id = Uuid::new_v4();
        let settings = ConsumerSettings {
            prefetch: 0,
            retry_delay: Duration::from_millis(1),
            max_attempts: 3,
        };
        let processor = Arc::new(FailingProcessor::default());

        let consumer = TenantConsumer::start(tenant_id, 1, &client, processor.clone(), &settings)
            .await
            .unwrap();

        publish(&broker, tenant_id, serde_json::json!({ "poison": true })).await;
        eventually(|| consumer.snapshot().dropped == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = consumer.snapshot();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.failed, 3);
        assert_eq!(snapshot.processed, 0);

        let stats = broker.stats();
        assert_eq!(stats.published, 3, "original plus two retries");
        assert_eq!(stats.acked, 3);
        assert_eq!(broker.queue_depth(&queue_name(&tenant_id)), Some(0));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dropped_at_once() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()));
        let tenant_id = Uuid::new_v4();
        let processor = Arc::new(FailingProcessor::default());

        let consumer = TenantConsumer::start(tenant_id, 1, &client, processor.clone(), &ConsumerSettings::default())
            .await
            .unwrap();

        let channel = tmx_queue::BrokerConnection::create_channel(&broker).await.unwrap();
        channel.publish(&queue_name(&tenant_id), b"not json").await.unwrap();

        eventually(|| consumer.snapshot().dropped == 1).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stats().published, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_stops_consumer() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(Arc::new(broker.clone()));
        let tenant_id = Uuid::new_v4();
        let processor = Arc::new(RecordingProcessor { seen: Mutex::new(Vec::new()) });

        let consumer = TenantConsumer::start(tenant_id, 1, &client, processor, &ConsumerSettings::default())
            .await
            .unwrap();

        client.close_channel(consumer.channel_name()).await.unwrap();
        assert!(consumer.wait_stopped(Duration::from_secs(1)).await);
    }
}
