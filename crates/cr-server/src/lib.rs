//! ChatRelay server components
//!
//! - [`ingress`]: validate, acknowledge and forward inbound messages
//! - [`session`]: room -> live connection registry
//! - [`fanout`]: per-room broker consumer that rebroadcasts and persists
//! - [`writer`]: bounded, batched, idempotent persistence
//! - [`store`]: PostgreSQL / SQLite message stores
//! - [`app`], [`ws`]: axum routes

pub mod app;
pub mod error;
pub mod fanout;
pub mod ingress;
pub mod server_metrics;
pub mod session;
pub mod store;
pub mod writer;
pub mod ws;

pub use app::{router, AppState, HealthResponse};
pub use error::{FanoutError, RecordError, StoreError};
pub use fanout::{
    Delivery, DeliveryOutcome, DeliverySource, FanoutConfig, FanoutConsumer, FanoutCounters, FanoutProcessor,
    FanoutStats, Subscription,
};
pub use ingress::{ConnectionEvent, IngressConfig, IngressHandler, IngressOutcome, IngressStats};
pub use session::{Outbound, SessionError, SessionHandle, SessionRegistry};
pub use store::{
    connect_store, BatchOutcome, MessageStore, PersistedRecord, PostgresMessageStore, SqliteMessageStore,
};
pub use writer::{DurableWriter, WriteSink, WriterConfig, WriterStats};

#[cfg(feature = "amqp")]
pub use fanout::{AmqpDelivery, AmqpRoomSource, AmqpSubscription};
