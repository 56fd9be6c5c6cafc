//! BrokerClient - one broker connection with a cache of named channels

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{BrokerChannel, BrokerConnection, Result};

/// Owns one broker connection and lazily opens named channels on it.
///
/// Every mutation of the channel map happens under a single lock, including
/// the network round trip that opens a channel, so two callers asking for the
/// same name always end up sharing one channel.
pub struct BrokerClient {
    connection: Arc<dyn BrokerConnection>,
    channels: Mutex<HashMap<String, Arc<dyn BrokerChannel>>>,
}

impl BrokerClient {
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            connection,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to an AMQP broker
    #[cfg(feature = "amqp")]
    pub async fn connect_amqp(uri: &str, publisher_confirms: bool) -> Result<Self> {
        let connection = crate::amqp::AmqpConnection::connect(uri, publisher_confirms).await?;
        Ok(Self::new(Arc::new(connection)))
    }

    /// Return the cached channel for `name`, opening one if needed.
    /// A cached channel the broker has since closed is replaced.
    pub async fn open_channel(&self, name: &str) -> Result<Arc<dyn BrokerChannel>> {
        let mut channels = self.channels.lock().await;

        if let Some(channel) = channels.get(name) {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            warn!(channel = %name, "Cached channel is closed, reopening");
            channels.remove(name);
        }

        let channel = self.connection.create_channel().await?;
        channels.insert(name.to_string(), channel.clone());
        debug!(channel = %name, "Opened channel");

        Ok(channel)
    }

    pub async fn declare_queue(&self, channel: &dyn BrokerChannel, name: &str) -> Result<()> {
        channel.declare_queue(name).await?;
        debug!(queue = %name, "Declared queue");
        Ok(())
    }

    pub async fn delete_queue(&self, channel: &dyn BrokerChannel, name: &str) -> Result<()> {
        channel.delete_queue(name).await?;
        info!(queue = %name, "Deleted queue");
        Ok(())
    }

    /// Close and evict the channel called `name`. Absent names are a no-op.
    pub async fn close_channel(&self, name: &str) -> Result<()> {
        let removed = self.channels.lock().await.remove(name);

        if let Some(channel) = removed {
            channel.close().await?;
            debug!(channel = %name, "Closed channel");
        }

        Ok(())
    }

    /// Close every cached channel, then the connection
    pub async fn close_all(&self) -> Result<()> {
        let mut channels = self.channels.lock().await;

        for (name, channel) in channels.drain() {
            if let Err(e) = channel.close().await {
                warn!(channel = %name, error = %e, "Failed to close channel");
            }
        }

        self.connection.close().await?;
        info!("Broker connection closed");
        Ok(())
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}
