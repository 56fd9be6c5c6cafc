//! End-to-end tenant lifecycle tests against the in-memory broker and an
//! in-memory SQLite store

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Semaphore;
use uuid::Uuid;

use tmx_common::{channel_name, queue_name, Tenant, MAX_CONCURRENCY};
use tmx_queue::{BrokerClient, MemoryBroker};
use tmx_router::{
    ConsumerRegistry, ConsumerSettings, ErrorKind, MessageProcessor, MessageService, RouterError,
    StoreProcessor, TenantService,
};
use tmx_store::{MessageStore, SqliteStore, TenantDirectory};

struct Harness {
    broker: MemoryBroker,
    client: Arc<BrokerClient>,
    store: Arc<SqliteStore>,
    registry: Arc<ConsumerRegistry>,
    tenants: TenantService,
    messages: MessageService,
}

async fn harness_with(processor: Option<Arc<dyn MessageProcessor>>) -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    store.init_schema().await.unwrap();

    let broker = MemoryBroker::new();
    let client = Arc::new(BrokerClient::new(Arc::new(broker.clone())));
    let processor: Arc<dyn MessageProcessor> = match processor {
        Some(processor) => processor,
        None => Arc::new(StoreProcessor::new(store.clone())),
    };
    let settings = ConsumerSettings {
        prefetch: 0,
        retry_delay: Duration::from_millis(10),
        max_attempts: 5,
    };
    let registry = Arc::new(ConsumerRegistry::new(client.clone(), processor, settings));

    Harness {
        tenants: TenantService::new(store.clone(), store.clone(), registry.clone(), client.clone()),
        messages: MessageService::new(store.clone(), store.clone(), client.clone()),
        broker,
        client,
        store,
        registry,
    }
}

async fn harness() -> Harness {
    harness_with(None).await
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Holds every message until the gate is opened, recording peak concurrency
struct GatedProcessor {
    gate: Semaphore,
    current: AtomicU32,
    peak: AtomicU32,
    done: AtomicU32,
}

impl GatedProcessor {
    fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            current: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            done: AtomicU32::new(0),
        })
    }

    fn open(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl MessageProcessor for GatedProcessor {
    async fn process(&self, _tenant_id: &Uuid, _body: &[u8]) -> tmx_router::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let _pass = self
            .gate
            .acquire()
            .await
            .map_err(|e| RouterError::processing(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Waits for the gate, then persists like the real processor
struct GatedStoreProcessor {
    gate: Semaphore,
    started: AtomicU32,
    inner: StoreProcessor,
}

#[async_trait]
impl MessageProcessor for GatedStoreProcessor {
    async fn process(&self, tenant_id: &Uuid, body: &[u8]) -> tmx_router::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _pass = self
            .gate
            .acquire()
            .await
            .map_err(|e| RouterError::processing(e.to_string()))?;
        self.inner.process(tenant_id, body).await
    }
}

/// Fails the first `failures` calls, then persists like the real processor
struct FlakyProcessor {
    remaining_failures: AtomicU32,
    inner: StoreProcessor,
}

#[async_trait]
impl MessageProcessor for FlakyProcessor {
    async fn process(&self, tenant_id: &Uuid, body: &[u8]) -> tmx_router::Result<()> {
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.store(left - 1, Ordering::SeqCst);
            return Err(RouterError::processing("downstream unavailable"));
        }
        self.inner.process(tenant_id, body).await
    }
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let processor = GatedProcessor::new(true);
    let h = harness_with(Some(processor.clone() as Arc<dyn MessageProcessor>)).await;

    let tenant = h.tenants.create_tenant("bounded", Some(3)).await.unwrap();
    for i in 0..20 {
        h.messages.publish(tenant.id, json!({ "n": i })).await.unwrap();
    }

    wait_until(|| async { processor.done.load(Ordering::SeqCst) == 20 }).await;

    let peak = processor.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded limit", peak);
    assert!(peak > 1, "work was never parallel");

    let status = h.tenants.consumer_status(tenant.id).await.unwrap();
    wait_until(|| async { h.broker.stats().acked == 20 }).await;
    assert_eq!(status.capacity, 3);
}

#[tokio::test]
async fn test_resize_below_in_flight_converges() {
    let processor = GatedProcessor::new(false);
    let h = harness_with(Some(processor.clone() as Arc<dyn MessageProcessor>)).await;

    let tenant = h.tenants.create_tenant("shrinking", Some(4)).await.unwrap();
    for i in 0..8 {
        h.messages.publish(tenant.id, json!({ "n": i })).await.unwrap();
    }

    wait_until(|| async { h.tenants.consumer_status(tenant.id).await.unwrap().in_flight == 4 }).await;

    let updated = h.tenants.update_concurrency(tenant.id, 1).await.unwrap();
    assert_eq!(updated.concurrency, 1);

    let status = h.tenants.consumer_status(tenant.id).await.unwrap();
    assert_eq!(status.capacity, 1);
    assert_eq!(status.in_flight, 4);

    processor.peak.store(0, Ordering::SeqCst);
    processor.open();

    wait_until(|| async { processor.done.load(Ordering::SeqCst) == 8 }).await;
    wait_until(|| async { h.tenants.consumer_status(tenant.id).await.unwrap().in_flight == 0 }).await;

    assert_eq!(processor.peak.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.get_tenant(&tenant.id).await.unwrap().unwrap().concurrency, 1);
}

#[tokio::test]
async fn test_delete_while_in_flight() {
    let processor = GatedProcessor::new(false);
    let h = harness_with(Some(processor.clone() as Arc<dyn MessageProcessor>)).await;

    let tenant = h.tenants.create_tenant("doomed", Some(2)).await.unwrap();
    for i in 0..4 {
        h.messages.publish(tenant.id, json!({ "n": i })).await.unwrap();
    }
    wait_until(|| async { h.tenants.consumer_status(tenant.id).await.unwrap().in_flight == 2 }).await;

    h.tenants.delete_tenant(tenant.id).await.unwrap();

    assert!(!h.registry.contains(tenant.id).await);
    assert!(!h.client.channel_names().await.contains(&channel_name(&tenant.id)));
    assert!(!h.broker.queue_names().contains(&queue_name(&tenant.id)));

    processor.open();
    assert!(h.registry.wait_retired(Duration::from_secs(5)).await);
    assert_eq!(h.registry.cleanup_retired(), 0);

    let err = h.tenants.get_tenant(tenant.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_publish_consume_read_round_trip() {
    let h = harness().await;
    let tenant = h.tenants.create_tenant("roundtrip", None).await.unwrap();

    let payload = json!({ "order": 42, "items": ["a", "b"] });
    h.messages.publish(tenant.id, payload.clone()).await.unwrap();

    wait_until(|| async { h.messages.count_messages(tenant.id).await.unwrap() == 1 }).await;

    let page = h.messages.get_messages(tenant.id, None, None).await.unwrap();
    let matching: Vec<_> = page.data.iter().filter(|m| m.payload == payload).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].tenant_id, tenant.id);
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_cursor_pagination() {
    let h = harness().await;
    let tenant = Tenant::new("paged", 3);
    h.store.insert_tenant(&tenant).await.unwrap();
    h.store.create_partition(&tenant.id).await.unwrap();
    for i in 0..15 {
        h.store.insert_message(&tenant.id, &json!({ "n": i })).await.unwrap();
    }

    let first = h.messages.get_messages(tenant.id, None, Some(5)).await.unwrap();
    assert_eq!(first.data.len(), 5);
    let cursor = first.next_cursor.clone().expect("first page has a cursor");

    let second = h.messages.get_messages(tenant.id, Some(&cursor), Some(5)).await.unwrap();
    assert_eq!(second.data.len(), 5);
    assert!(second.data.iter().all(|m| !first.data.iter().any(|f| f.id == m.id)));
    assert!(second.data.windows(2).all(|w| w[0].created_at < w[1].created_at));
    assert!(first.data.last().unwrap().created_at < second.data[0].created_at);

    let third = h
        .messages
        .get_messages(tenant.id, second.next_cursor.as_deref(), Some(5))
        .await
        .unwrap();
    assert_eq!(third.data.len(), 5);
    assert!(third.next_cursor.is_none());
    assert_eq!(third.data.last().unwrap().payload, json!({ "n": 14 }));
}

#[tokio::test]
async fn test_publish_before_consumer_then_restore() {
    let h = harness().await;
    let tenant = Tenant::new("dormant", 2);
    h.store.insert_tenant(&tenant).await.unwrap();
    h.store.create_partition(&tenant.id).await.unwrap();

    h.messages.publish(tenant.id, json!({ "n": 1 })).await.unwrap();
    h.messages.publish(tenant.id, json!({ "n": 2 })).await.unwrap();

    assert_eq!(h.broker.queue_names(), vec![queue_name(&tenant.id)]);
    assert_eq!(h.broker.queue_depth(&queue_name(&tenant.id)), Some(2));

    let summary = h.tenants.restore_consumers().await.unwrap();
    assert_eq!(summary.started, 1);
    assert_eq!(summary.failed, 0);

    wait_until(|| async { h.messages.count_messages(tenant.id).await.unwrap() == 2 }).await;

    let again = h.tenants.restore_consumers().await.unwrap();
    assert_eq!(again.started, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn test_zero_concurrency_defaults_to_three() {
    let h = harness().await;

    let tenant = h.tenants.create_tenant("defaults", Some(0)).await.unwrap();
    assert_eq!(tenant.concurrency, 3);
    assert_eq!(h.tenants.consumer_status(tenant.id).await.unwrap().capacity, 3);

    let negative = h.tenants.create_tenant("negative", Some(-2)).await.unwrap();
    assert_eq!(negative.concurrency, 3);
}

#[tokio::test]
async fn test_error_classification() {
    let h = harness().await;
    let unknown = Uuid::new_v4();

    let err = h.tenants.delete_tenant(unknown).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.tenants.update_concurrency(unknown, 4).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.messages.publish(unknown, json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let tenant = h.tenants.create_tenant("strict", None).await.unwrap();

    let err = h.messages.get_messages(tenant.id, Some("not-a-time"), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.tenants.update_concurrency(tenant.id, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.messages.publish(tenant.id, json!([1, 2, 3])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.tenants.create_tenant("   ", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_processing_failure_is_retried() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    store.init_schema().await.unwrap();

    let processor = Arc::new(FlakyProcessor {
        remaining_failures: AtomicU32::new(2),
        inner: StoreProcessor::new(store.clone()),
    });

    let broker = MemoryBroker::new();
    let client = Arc::new(BrokerClient::new(Arc::new(broker.clone())));
    let settings = ConsumerSettings {
        prefetch: 0,
        retry_delay: Duration::from_millis(10),
        max_attempts: 5,
    };
    let registry = Arc::new(ConsumerRegistry::new(client.clone(), processor, settings));
    let tenants = TenantService::new(store.clone(), store.clone(), registry.clone(), client.clone());
    let messages = MessageService::new(store.clone(), store.clone(), client.clone());

    let tenant = tenants.create_tenant("flaky", Some(1)).await.unwrap();
    messages.publish(tenant.id, json!({ "attempt": "eventually" })).await.unwrap();

    wait_until(|| async { messages.count_messages(tenant.id).await.unwrap() == 1 }).await;

    let stats = broker.stats();
    assert_eq!(stats.published, 3, "original plus two retries");
    assert_eq!(stats.nacked, 0);

    let status = tenants.consumer_status(tenant.id).await.unwrap();
    assert_eq!(status.failed, 2);
    assert_eq!(status.dropped, 0);
    wait_until(|| async { tenants.consumer_status(tenant.id).await.unwrap().processed == 1 }).await;
    wait_until(|| async { broker.stats().acked == 3 }).await;
}

#[tokio::test]
async fn test_concurrency_upper_bound() {
    let h = harness().await;
    let too_many = MAX_CONCURRENCY as i64 + 1;

    let err = h.tenants.create_tenant("greedy", Some(too_many)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = h.tenants.create_tenant("greedy", Some(3_000_000_000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.tenants.list_tenants().await.unwrap().is_empty());

    let tenant = h.tenants.create_tenant("roomy", Some(MAX_CONCURRENCY as i64)).await.unwrap();
    assert_eq!(tenant.concurrency, MAX_CONCURRENCY);

    let err = h.tenants.update_concurrency(tenant.id, too_many).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let stored = h.store.get_tenant(&tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.concurrency, MAX_CONCURRENCY);
    assert_eq!(h.tenants.consumer_status(tenant.id).await.unwrap().capacity, MAX_CONCURRENCY);
}

#[tokio::test]
async fn test_deleted_tenant_leaves_no_rows_behind() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    store.init_schema().await.unwrap();

    let processor = Arc::new(GatedStoreProcessor {
        gate: Semaphore::new(0),
        started: AtomicU32::new(0),
        inner: StoreProcessor::new(store.clone()),
    });

    let broker = MemoryBroker::new();
    let client = Arc::new(BrokerClient::new(Arc::new(broker.clone())));
    let settings = ConsumerSettings {
        prefetch: 0,
        retry_delay: Duration::from_millis(1),
        max_attempts: 2,
    };
    let registry = Arc::new(ConsumerRegistry::new(
        client.clone(),
        processor.clone() as Arc<dyn MessageProcessor>,
        settings,
    ));
    let tenants = TenantService::new(store.clone(), store.clone(), registry.clone(), client.clone());
    let messages = MessageService::new(store.clone(), store.clone(), client.clone());

    let tenant = tenants.create_tenant("vanishing", Some(2)).await.unwrap();
    for i in 0..2 {
        messages.publish(tenant.id, json!({ "n": i })).await.unwrap();
    }
    wait_until(|| async { processor.started.load(Ordering::SeqCst) == 2 }).await;

    tenants.delete_tenant(tenant.id).await.unwrap();

    // The held tasks now try to persist into the dropped partition.
    processor.gate.add_permits(10);
    assert!(registry.wait_retired(Duration::from_secs(5)).await);

    assert_eq!(store.count_messages(&tenant.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight() {
    let processor = GatedProcessor::new(false);
    let h = harness_with(Some(processor.clone() as Arc<dyn MessageProcessor>)).await;

    let tenant = h.tenants.create_tenant("draining", Some(2)).await.unwrap();
    for i in 0..2 {
        h.messages.publish(tenant.id, json!({ "n": i })).await.unwrap();
    }
    wait_until(|| async { h.tenants.consumer_status(tenant.id).await.unwrap().in_flight == 2 }).await;

    let registry = h.registry.clone();
    let shutdown = tokio::spawn(async move { registry.shutdown(Duration::from_secs(5)).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    processor.open();
    shutdown.await.unwrap();

    assert_eq!(h.broker.stats().acked, 2);
    assert!(h.registry.is_empty().await);
    assert!(!h.client.channel_names().await.contains(&channel_name(&tenant.id)));
}
