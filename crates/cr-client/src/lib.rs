//! ChatRelay send side
//!
//! [`CorrelationEngine`] pairs each outbound message with the acknowledgment
//! the server sends back for it, retrying with backoff until it is
//! acknowledged or the attempt budget runs out. Links are opened through a
//! [`Connector`]; [`WsConnector`] speaks to a ChatRelay server over WebSocket.

pub mod client_metrics;
pub mod connector;
pub mod engine;
pub mod error;

pub use connector::{Connector, Link, LinkEvent, LinkSender, WsConnector};
pub use engine::{
    CorrelationConfig, CorrelationEngine, EngineStats, FailureScope, RetryState, SendOutcome,
    STATUS_ACKNOWLEDGED, STATUS_FAILED,
};
pub use error::ClientError;

pub type Result<T> = std::result::Result<T, ClientError>;
