//! TenantMux broker plumbing
//!
//! - `BrokerConnection` / `BrokerChannel` / `Delivery`: the seams the consumer
//!   runtime and publish path are written against
//! - `BrokerClient`: one connection plus a cache of named channels
//! - `amqp`: RabbitMQ backend (lapin)
//! - `memory`: in-process backend for tests and local development

pub mod error;
pub mod client;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::QueueError;
pub use client::BrokerClient;
pub use memory::{MemoryBroker, MemoryBrokerStats};

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Stream of deliveries for one subscription. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>>>;

/// One unit of work received from a queue, awaiting acknowledgement
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    /// True when the broker has handed this message out before
    fn redelivered(&self) -> bool;

    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A multiplexed session on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel. Zero means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish a persistent message to `queue` through the default exchange
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Start a manual-ack subscription on `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// A live broker connection that hands out channels
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}
