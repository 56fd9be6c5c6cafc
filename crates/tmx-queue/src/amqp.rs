//! RabbitMQ backend built on lapin

use std::sync::Arc;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use crate::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream, QueueError, Result};

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_PERSISTENT: u8 = 2;

pub struct AmqpConnection {
    connection: Connection,
    publisher_confirms: bool,
}

impl AmqpConnection {
    pub async fn connect(uri: &str, publisher_confirms: bool) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        info!(publisher_confirms = publisher_confirms, "Connected to AMQP broker");

        Ok(Self {
            connection,
            publisher_confirms,
        })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;

        if self.publisher_confirms {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "shutdown").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        self.channel.queue_declare(name, options, FieldTable::default()).await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let purged = self.channel.queue_delete(name, QueueDeleteOptions::default()).await?;
        debug!(queue = %name, purged = purged, "Queue deleted");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await?;

        // Resolves immediately with NotRequested unless confirm_select was issued.
        if let Confirmation::Nack(_) = confirm.await? {
            return Err(QueueError::PublishNacked(queue.to_string()));
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|item| {
            item.map(|delivery| Box::new(AmqpDelivery { delivery }) as Box<dyn Delivery>)
                .map_err(QueueError::from)
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "closed").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpDelivery {
    delivery: LapinDelivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    async fn ack(&self) -> Result<()> {
        self.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.delivery.acker.nack(options).await?;
        Ok(())
    }
}
