//! In-process broker
//!
//! Implements the broker seams entirely in memory so the consumer runtime can
//! run without RabbitMQ (tests, local development). It follows the AMQP
//! contract the runtime depends on:
//! - queues must be declared before publish/consume
//! - nack with requeue puts the message back, flagged as redelivered
//! - closing a channel ends its delivery streams and makes later acks fail
//! - a delivery dropped without ack/nack goes back to its queue

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream, QueueError, Result};

/// Counters exposed for assertions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub channels_opened: u64,
    pub queue_declarations: u64,
}

struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Pending>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Pending>>,
    depth: AtomicUsize,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, pending: Pending) {
        // The queue owns both halves, so the receiver is alive for as long as self is.
        if self.tx.send(pending).is_ok() {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn pop(&self) -> Option<Pending> {
        let mut rx = self.rx.lock().await;
        let pending = rx.recv().await;
        if pending.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        pending
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    channel_closers: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    disconnected: AtomicBool,
    next_tag: AtomicU64,
    published: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    requeued: AtomicU64,
    channels_opened: AtomicU64,
    queue_declarations: AtomicU64,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }
}

/// In-memory broker connection
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        let s = &self.state;
        MemoryBrokerStats {
            published: s.published.load(Ordering::SeqCst),
            acked: s.acked.load(Ordering::SeqCst),
            nacked: s.nacked.load(Ordering::SeqCst),
            requeued: s.requeued.load(Ordering::SeqCst),
            channels_opened: s.channels_opened.load(Ordering::SeqCst),
            queue_declarations: s.queue_declarations.load(Ordering::SeqCst),
        }
    }

    /// Names of all declared queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages ready for delivery on `queue` (excludes unacknowledged ones)
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state
            .queues
            .lock()
            .get(queue)
            .map(|q| q.depth.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.state.disconnected.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("connection is closed".to_string()));
        }

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        {
            let mut closers = self.state.channel_closers.lock();
            closers.retain(|c| !*c.borrow());
            closers.push(closed_tx.clone());
        }
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            closed_tx,
            closed_rx,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        for closer in self.state.channel_closers.lock().drain(..) {
            closer.send_replace(true);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.state.disconnected.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueueError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
        self.state.queue_declarations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.queues.lock().remove(name);
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let target = self.state.queue(queue)?;
        target.push(Pending { body: body.to_vec(), redelivered: false });
        self.state.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let source = self.state.queue(queue)?;

        let subscription = Subscription {
            queue: source,
            broker: self.state.clone(),
            closed: self.closed_rx.clone(),
        };

        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            if *sub.closed.borrow() {
                return None;
            }

            let next = tokio::select! {
                _ = sub.closed.changed() => None,
                pending = sub.queue.pop() => pending,
            };
            let pending = next?;

            let delivery = MemoryDelivery {
                tag: sub.broker.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
                body: pending.body,
                redelivered: pending.redelivered,
                queue: sub.queue.clone(),
                broker: sub.broker.clone(),
                closed: sub.closed.clone(),
                settled: AtomicBool::new(false),
            };

            Some((Ok(Box::new(delivery) as Box<dyn Delivery>), sub))
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed_tx.send_replace(true);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow() && !self.state.disconnected.load(Ordering::SeqCst)
    }
}

struct Subscription {
    queue: Arc<MemoryQueue>,
    broker: Arc<BrokerState>,
    closed: watch::Receiver<bool>,
}

struct MemoryDelivery {
    tag: u64,
    body: Vec<u8>,
    redelivered: bool,
    queue: Arc<MemoryQueue>,
    broker: Arc<BrokerState>,
    closed: watch::Receiver<bool>,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn settle(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(QueueError::Channel("channel is closed".to_string()));
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Channel(format!("delivery {} already settled", self.tag)));
        }
        Ok(())
    }

    fn requeue(&self) {
        self.queue.push(Pending { body: self.body.clone(), redelivered: true });
        self.broker.requeued.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.broker.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        self.broker.nacked.fetch_add(1, Ordering::SeqCst);
        if requeue {
            self.requeue();
        }
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        // Unsettled deliveries return to the queue, as they would when an AMQP channel closes.
        if !self.settled.load(Ordering::SeqCst) {
            self.requeue();
        }
    }
}
