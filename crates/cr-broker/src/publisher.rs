use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::{BrokerError, CircuitBreaker, Result};

/// Publishes a serialized chat message to a room's exchange.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, room_id: &str, payload: &str) -> Result<()>;
}

#[async_trait]
impl<P: MessagePublisher + ?Sized> MessagePublisher for Arc<P> {
    async fn publish(&self, room_id: &str, payload: &str) -> Result<()> {
        (**self).publish(room_id, payload).await
    }
}

/// Wraps a publisher with circuit breaker admission.
///
/// Rejected calls fail with [`BrokerError::CircuitOpen`] without touching the
/// inner publisher. Only transport failures count against the breaker.
pub struct GuardedPublisher<P> {
    inner: P,
    breaker: Arc<CircuitBreaker>,
}

impl<P> GuardedPublisher<P> {
    pub fn new(inner: P, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<P: MessagePublisher> MessagePublisher for GuardedPublisher<P> {
    async fn publish(&self, room_id: &str, payload: &str) -> Result<()> {
        if !self.breaker.allow_request() {
            debug!(room_id, breaker = %self.breaker.name(), "Publish rejected by open breaker");
            return Err(BrokerError::CircuitOpen);
        }

        let result = self.inner.publish(room_id, payload).await;
        match &result {
            Ok(()) => self.breaker.record_success(),
            Err(e) if e.is_transport() || matches!(e, BrokerError::PoolExhausted { .. }) => {
                self.breaker.record_failure()
            }
            Err(_) => {}
        }
        result
    }
}

#[cfg(feature = "amqp")]
pub use self::amqp::AmqpPublisher;

#[cfg(feature = "amqp")]
mod amqp {
    use async_trait::async_trait;
    use lapin::{options::BasicPublishOptions, BasicProperties};
    use tracing::debug;

    use super::MessagePublisher;
    use crate::{broker_metrics, topology, AmqpChannelManager, BrokerError, ChannelPool, Result};

    /// Publishes persistent messages to `chat.exchange.<room>` over pooled channels.
    #[derive(Clone)]
    pub struct AmqpPublisher {
        pool: ChannelPool<AmqpChannelManager>,
    }

    impl AmqpPublisher {
        pub fn new(pool: ChannelPool<AmqpChannelManager>) -> Self {
            Self { pool }
        }

        async fn try_publish(&self, room_id: &str, payload: &str) -> Result<()> {
            let channel = self.pool.borrow().await?;

            let confirmation = channel
                .basic_publish(
                    &topology::exchange_name(room_id),
                    "",
                    BasicPublishOptions::default(),
                    payload.as_bytes(),
                    BasicProperties::default()
                        .with_delivery_mode(2)
                        .with_content_type("application/json".into()),
                )
                .await
                .map_err(|e| BrokerError::Publish(format!("Publish failed: {}", e)))?
                .await
                .map_err(|e| BrokerError::Publish(format!("Publish confirm failed: {}", e)))?;

            if confirmation.is_nack() {
                return Err(BrokerError::Publish(format!("Broker nacked message for room {}", room_id)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessagePublisher for AmqpPublisher {
        async fn publish(&self, room_id: &str, payload: &str) -> Result<()> {
            let result = self.try_publish(room_id, payload).await;
            broker_metrics::record_publish(room_id, result.is_ok());
            if result.is_ok() {
                debug!(room_id, bytes = payload.len(), "Message published to room exchange");
            }
            result
        }
    }
}
