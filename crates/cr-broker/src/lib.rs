//! Broker plumbing for room fan-out
//!
//! - [`ChannelPool`]: fixed-size pool of broker channels over one connection
//! - [`CircuitBreaker`]: three-state admission guard
//! - [`MessagePublisher`]: publish a serialized message to a room exchange
//! - [`topology`]: exchange/queue naming and declaration

pub mod circuit_breaker;
pub mod error;
pub mod broker_metrics;
pub mod pool;
pub mod publisher;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerConfig};
pub use error::BrokerError;
pub use pool::{ChannelManager, ChannelPool, PoolConfig, PoolStats, PooledChannel};
pub use publisher::{GuardedPublisher, MessagePublisher};

#[cfg(feature = "amqp")]
pub use amqp::AmqpChannelManager;
#[cfg(feature = "amqp")]
pub use publisher::AmqpPublisher;

pub type Result<T> = std::result::Result<T, BrokerError>;
