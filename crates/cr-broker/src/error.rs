use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("No channel available after {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Channel pool is closed")]
    PoolClosed,

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Topology error: {0}")]
    Topology(String),
}

impl BrokerError {
    /// Whether the failure means the underlying channel or connection is broken.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Channel(_) | BrokerError::Publish(_)
        )
    }
}
