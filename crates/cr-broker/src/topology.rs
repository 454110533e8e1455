//! Per-room broker topology
//!
//! Each room has one durable fan-out exchange `chat.exchange.<room>`. Each
//! server instance binds its own durable queue `queue_<instance>_<room>` to
//! it with an empty routing key, so every instance sees every message.

pub const EXCHANGE_PREFIX: &str = "chat.exchange.";

pub fn exchange_name(room_id: &str) -> String {
    format!("{}{}", EXCHANGE_PREFIX, room_id)
}

pub fn queue_name(instance_id: &str, room_id: &str) -> String {
    format!("queue_{}_{}", instance_id, room_id)
}

#[cfg(feature = "amqp")]
pub use self::amqp::*;

#[cfg(feature = "amqp")]
mod amqp {
    use lapin::{
        options::{ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions},
        types::FieldTable,
        Channel, ExchangeKind,
    };
    use tracing::{info, warn};

    use super::{exchange_name, queue_name};
    use crate::{AmqpChannelManager, BrokerError, ChannelPool, Result};

    pub async fn declare_room_exchange(channel: &Channel, room_id: &str) -> Result<()> {
        channel
            .exchange_declare(
                &exchange_name(room_id),
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange for {}: {}", room_id, e)))
    }

    /// Declare and bind this instance's queue for a room. Returns the queue name.
    pub async fn declare_room_queue(channel: &Channel, instance_id: &str, room_id: &str) -> Result<String> {
        let queue = queue_name(instance_id, room_id);
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare queue {}: {}", queue, e)))?;

        channel
            .queue_bind(
                &queue,
                &exchange_name(room_id),
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind queue {}: {}", queue, e)))?;

        Ok(queue)
    }

    /// Declare the exchanges for all rooms on one pooled channel.
    pub async fn declare_exchanges(pool: &ChannelPool<AmqpChannelManager>, rooms: &[String]) -> Result<()> {
        let channel = pool.borrow().await?;
        for room in rooms {
            declare_room_exchange(&channel, room).await?;
        }
        info!(rooms = rooms.len(), "Declared room exchanges");
        Ok(())
    }

    /// Best-effort removal of the room exchanges.
    pub async fn delete_exchanges(pool: &ChannelPool<AmqpChannelManager>, rooms: &[String]) {
        let channel = match pool.borrow().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "No channel available to delete exchanges");
                return;
            }
        };
        for room in rooms {
            if let Err(e) = channel
                .exchange_delete(&exchange_name(room), ExchangeDeleteOptions::default())
                .await
            {
                warn!(room_id = %room, error = %e, "Failed to delete exchange");
            }
        }
        info!(rooms = rooms.len(), "Deleted room exchanges");
    }
}
