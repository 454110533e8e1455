//! Inbound connection events
//!
//! Each connection feeds a small closed set of events into one handler:
//! `Opened` registers the room session, `Text` validates, acknowledges and
//! forwards the message, `TransportError` closes the connection, `Closed`
//! deregisters it if it is still the room's current session.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cr_broker::MessagePublisher;
use cr_common::{AckFrame, ChatMessage};

use crate::server_metrics;
use crate::session::{SessionHandle, SessionRegistry};

#[derive(Debug)]
pub enum ConnectionEvent<'a> {
    Opened,
    Text(&'a str),
    TransportError(String),
    Closed,
}

/// What happened to one event; mostly useful to tests and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    Registered,
    /// Acked and handed to the broker
    Accepted(Uuid),
    /// Failed validation; nothing is sent back
    Dropped,
    /// The ack could not be written; nothing was published
    AckFailed(Uuid),
    /// Acked, but the broker publish failed
    PublishFailed(Uuid),
    Closed,
}

#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Stamped into accepted messages as `serverId`
    pub server_id: String,
    /// Maximum wait for room in a connection's outbound queue
    pub send_timeout: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            server_id: "chatrelay".to_string(),
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressStats {
    pub open_connections: usize,
    pub accepted: u64,
    pub ack_failures: u64,
    pub publish_failures: u64,
}

pub struct IngressHandler {
    config: IngressConfig,
    registry: Arc<SessionRegistry>,
    publisher: Arc<dyn MessagePublisher>,
    open_connections: AtomicUsize,
    accepted: AtomicU64,
    ack_failures: AtomicU64,
    publish_failures: AtomicU64,
}

impl IngressHandler {
    pub fn new(
        config: IngressConfig,
        registry: Arc<SessionRegistry>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            config,
            registry,
            publisher,
            open_connections: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn send_timeout(&self) -> Duration {
        self.config.send_timeout
    }

    pub async fn handle(&self, session: &SessionHandle, event: ConnectionEvent<'_>) -> IngressOutcome {
        match event {
            ConnectionEvent::Opened => {
                info!(
                    room_id = %session.room_id(),
                    session_id = session.id(),
                    client_ip = ?session.client_ip(),
                    "Connection opened"
                );
                self.open_connections.fetch_add(1, Ordering::SeqCst);
                self.registry.register(session.clone());
                IngressOutcome::Registered
            }
            ConnectionEvent::Text(text) => self.on_text(session, text).await,
            ConnectionEvent::TransportError(reason) => {
                warn!(room_id = %session.room_id(), session_id = session.id(), %reason, "Transport error, closing");
                session.close();
                IngressOutcome::Closed
            }
            ConnectionEvent::Closed => {
                session.close();
                let removed = self.registry.remove_if_current(session.room_id(), session.id());
                let _ = self
                    .open_connections
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                debug!(room_id = %session.room_id(), session_id = session.id(), removed, "Connection closed");
                IngressOutcome::Closed
            }
        }
    }

    async fn on_text(&self, session: &SessionHandle, text: &str) -> IngressOutcome {
        let mut message = match ChatMessage::parse_validated(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(room_id = %session.room_id(), error = %e, "Dropping invalid frame");
                return IngressOutcome::Dropped;
            }
        };

        let message_id = message.message_id;
        message.server_id = Some(self.config.server_id.clone());
        message.client_ip = session.client_ip().map(str::to_string);

        let (ack, payload) = match (
            serde_json::to_string(&AckFrame::received(message_id)),
            message.to_json(),
        ) {
            (Ok(ack), Ok(payload)) => (ack, payload),
            (Err(e), _) | (_, Err(e)) => {
                warn!(%message_id, error = %e, "Failed to serialize accepted message");
                return IngressOutcome::Dropped;
            }
        };

        if let Err(e) = session.send(ack, self.config.send_timeout).await {
            self.ack_failures.fetch_add(1, Ordering::Relaxed);
            server_metrics::record_ack_write_failure(&message.room_id);
            warn!(%message_id, room_id = %session.room_id(), error = %e, "Failed to write ack");
            return IngressOutcome::AckFailed(message_id);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        server_metrics::record_message_accepted(&message.room_id);

        match self.publisher.publish(&message.room_id, &payload).await {
            Ok(()) => {
                debug!(%message_id, room_id = %message.room_id, "Message forwarded to broker");
                IngressOutcome::Accepted(message_id)
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                server_metrics::record_ingress_publish_failure(&message.room_id);
                warn!(%message_id, room_id = %message.room_id, error = %e, "Failed to publish message");
                IngressOutcome::PublishFailed(message_id)
            }
        }
    }

    /// Connections that have opened and not yet closed, replaced ones included
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Wait up to `limit` for every connection to close. Returns whether they did.
    pub async fn wait_drained(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.open_connections() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(open_connections = self.open_connections(), "Connections still open after drain limit");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            open_connections: self.open_connections(),
            accepted: self.accepted.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
