//! AMQP channel manager (RabbitMQ and other AMQP 0-9-1 brokers)

use async_trait::async_trait;
use lapin::{options::ConfirmSelectOptions, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::{pool::ChannelManager, BrokerError, Result};

pub struct AmqpChannelManager {
    connection: Connection,
    /// Put new channels in publisher-confirm mode
    confirms: bool,
}

impl AmqpChannelManager {
    pub async fn connect(uri: &str, connection_name: &str, confirms: bool) -> Result<Self> {
        info!(connection = connection_name, "Connecting to AMQP broker");

        let connection = Connection::connect(
            uri,
            ConnectionProperties::default().with_connection_name(connection_name.into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("AMQP connection failed: {}", e)))?;

        Ok(Self {
            connection,
            confirms,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl ChannelManager for AmqpChannelManager {
    type Channel = Channel;

    async fn create_channel(&self) -> Result<Channel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("Failed to enable confirms: {}", e)))?;
        }

        Ok(channel)
    }

    fn is_open(&self, channel: &Channel) -> bool {
        channel.status().connected()
    }

    async fn close_channel(&self, channel: Channel) {
        if channel.status().connected() {
            if let Err(e) = channel.close(200, "Shutdown").await {
                debug!(error = %e, "Error closing channel");
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close(200, "Shutdown").await {
            debug!(error = %e, "Error closing AMQP connection");
        }
    }
}
