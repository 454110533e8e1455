use thiserror::Error;

use cr_common::ValidationError;

/// Failure to persist a batch. The whole batch is rolled back.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unsupported database url: {0}")]
    UnsupportedUrl(String),
}

/// A buffered payload that cannot become a persisted row.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Invalid message: {0}")]
    Invalid(#[from] ValidationError),

    #[error("userId {0} is not an integer")]
    UserId(String),
}

/// A broker delivery that could not be processed; the delivery is rejected.
#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Delivery payload is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Broadcast to room {room_id} failed: {reason}")]
    Broadcast { room_id: String, reason: String },

    #[error("Broker acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error(transparent)]
    Broker(#[from] cr_broker::BrokerError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
