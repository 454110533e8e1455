//! Send-side correlation engine
//!
//! Each room gets one lazily created logical connection. Every transmission
//! registers a pending entry keyed by `message_id`; a reader task per
//! connection resolves entries when matching acknowledgments arrive. Attempts
//! that time out or hit a transport error are retried with exponential
//! backoff, reusing the same `message_id`.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cr_common::{AckFrame, ChatMessage, InboundFrame};

use crate::client_metrics;
use crate::connector::{Connector, LinkEvent, LinkSender};
use crate::ClientError;

pub const STATUS_ACKNOWLEDGED: u16 = 200;
pub const STATUS_FAILED: u16 = 500;

/// Which pending requests a broken connection fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureScope {
    /// Only requests sent over the broken room connection
    #[default]
    Room,
    /// Every pending request in the engine
    Process,
}

#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Total transmissions per submit, including the first
    pub max_attempts: u32,
    /// Bounds the outbound write and then the wait for the ack, each on its own
    pub response_timeout: Duration,
    /// Bounds obtaining the room connection, including a handshake already
    /// under way for another submit
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub failure_scope: FailureScope,
    /// Capacity of the broadcast stream offered to subscribers
    pub broadcast_capacity: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            response_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(100),
            failure_scope: FailureScope::Room,
            broadcast_capacity: 1024,
        }
    }
}

/// Progress of one submit through its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts made so far (1-based once the first is under way)
    pub attempt: u32,
    pub next_deadline: Instant,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            next_deadline: Instant::now(),
        }
    }

    /// Delay after attempt `attempt`: `base * 2^attempt`.
    pub fn backoff(base: Duration, attempt: u32) -> Duration {
        base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// Schedule the next attempt relative to now and return its deadline.
    pub fn schedule_next(&mut self, base: Duration) -> Instant {
        self.next_deadline = Instant::now() + Self::backoff(base, self.attempt);
        self.next_deadline
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one `submit`.
#[derive(Debug)]
pub struct SendOutcome {
    pub message_id: Uuid,
    pub room_id: String,
    /// 200 when acknowledged, 500 on terminal failure
    pub status_code: u16,
    pub attempts: u32,
    pub latency: Duration,
    pub ack: Option<AckFrame>,
    pub last_error: Option<ClientError>,
}

impl SendOutcome {
    pub fn is_acknowledged(&self) -> bool {
        self.status_code == STATUS_ACKNOWLEDGED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub pending: usize,
    pub connections: usize,
    pub reconnections: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub retries: u64,
}

struct Connection {
    id: u64,
    room_id: String,
    sender: Arc<dyn LinkSender>,
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<Connection>>,
    opened: u64,
}

struct Pending {
    conn_id: u64,
    attempt: u32,
    tx: oneshot::Sender<Result<AckFrame, ClientError>>,
}

struct EngineInner {
    config: CorrelationConfig,
    connector: Arc<dyn Connector>,
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    pending: DashMap<Uuid, Pending>,
    in_flight: DashMap<Uuid, ()>,
    broadcasts: broadcast::Sender<ChatMessage>,
    next_conn_id: AtomicU64,
    live_connections: AtomicUsize,
    reconnections: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    closed: AtomicBool,
}

/// Removes the in-flight marker however the submit ends.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<Uuid, ()>,
    message_id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(in_flight: &'a DashMap<Uuid, ()>, message_id: Uuid) -> Result<Self, ClientError> {
        if in_flight.insert(message_id, ()).is_some() {
            return Err(ClientError::DuplicateInFlight(message_id));
        }
        Ok(Self {
            in_flight,
            message_id,
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.message_id);
    }
}

#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<EngineInner>,
}

impl CorrelationEngine {
    pub fn new(connector: Arc<dyn Connector>, config: CorrelationConfig) -> Self {
        let (broadcasts, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            inner: Arc::new(EngineInner {
                config,
                connector,
                slots: DashMap::new(),
                pending: DashMap::new(),
                in_flight: DashMap::new(),
                broadcasts,
                next_conn_id: AtomicU64::new(1),
                live_connections: AtomicUsize::new(0),
                reconnections: AtomicU64::new(0),
                acknowledged: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.inner.config
    }

    /// Send a message and wait for its acknowledgment, retrying on timeout
    /// or transport failure.
    ///
    /// Exhausting the attempts is not an `Err`: it resolves to a
    /// [`SendOutcome`] with [`STATUS_FAILED`]. `Err` is reserved for
    /// requests that cannot be attempted at all.
    pub async fn submit(&self, message: ChatMessage) -> Result<SendOutcome, ClientError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if message.room_id.is_empty() {
            return Err(ClientError::MissingRoom);
        }
        let _guard = InFlightGuard::acquire(&inner.in_flight, message.message_id)?;
        let payload = message.to_json()?;
        let message_id = message.message_id;
        let room_id = message.room_id;

        let started = Instant::now();
        let mut state = RetryState::new();
        let mut last_error = None;

        loop {
            state.attempt += 1;
            match inner.attempt(&room_id, message_id, &payload, state.attempt).await {
                Ok(ack) => {
                    let latency = started.elapsed();
                    inner.acknowledged.fetch_add(1, Ordering::Relaxed);
                    client_metrics::record_acknowledged(&room_id, state.attempt, latency);
                    debug!(
                        message_id = %message_id,
                        room_id = %room_id,
                        attempts = state.attempt,
                        latency_ms = latency.as_millis() as u64,
                        "Message acknowledged"
                    );
                    return Ok(SendOutcome {
                        message_id,
                        room_id,
                        status_code: STATUS_ACKNOWLEDGED,
                        attempts: state.attempt,
                        latency,
                        ack: Some(ack),
                        last_error,
                    });
                }
                Err(e) => {
                    let exhausted = state.attempt >= inner.config.max_attempts;
                    if exhausted || !e.is_retryable() || inner.closed.load(Ordering::SeqCst) {
                        inner.failed.fetch_add(1, Ordering::Relaxed);
                        client_metrics::record_terminal_failure(&room_id);
                        warn!(
                            message_id = %message_id,
                            room_id = %room_id,
                            attempts = state.attempt,
                            error = %e,
                            "Send failed terminally"
                        );
                        return Ok(SendOutcome {
                            message_id,
                            room_id,
                            status_code: STATUS_FAILED,
                            attempts: state.attempt,
                            latency: started.elapsed(),
                            ack: None,
                            last_error: Some(e),
                        });
                    }

                    let deadline = state.schedule_next(inner.config.backoff_base);
                    inner.retries.fetch_add(1, Ordering::Relaxed);
                    client_metrics::record_retry(&room_id, retry_reason(&e));
                    debug!(
                        message_id = %message_id,
                        room_id = %room_id,
                        attempt = state.attempt,
                        error = %e,
                        "Retrying send after backoff"
                    );
                    last_error = Some(e);
                    sleep_until(deadline).await;
                }
            }
        }
    }

    /// Messages broadcast to the rooms this engine has connections for.
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.broadcasts.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats {
            pending: inner.pending.len(),
            connections: inner.live_connections.load(Ordering::Relaxed),
            reconnections: inner.reconnections.load(Ordering::Relaxed),
            acknowledged: inner.acknowledged.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
        }
    }

    /// Close every connection and fail whatever is still pending.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids: Vec<Uuid> = inner.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = inner.pending.remove(&id) {
                let _ = pending.tx.send(Err(ClientError::Closed));
            }
        }

        // A slot stays locked while its handshake is under way
        let slots: Vec<_> = inner.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let Ok(mut slot) = timeout(inner.config.connect_timeout, slot.lock()).await else {
                continue;
            };
            if let Some(conn) = slot.conn.take() {
                drop(slot);
                inner.live_connections.fetch_sub(1, Ordering::Relaxed);
                inner.close_link(&conn).await;
            }
        }
        info!("Correlation engine closed");
    }
}

fn retry_reason(error: &ClientError) -> &'static str {
    match error {
        ClientError::Timeout(_) => "timeout",
        ClientError::Connect(_) => "connect",
        _ => "transport",
    }
}

impl EngineInner {
    async fn attempt(
        self: &Arc<Self>,
        room_id: &str,
        message_id: Uuid,
        payload: &str,
        attempt: u32,
    ) -> Result<AckFrame, ClientError> {
        let conn = match timeout(self.config.connect_timeout, self.connection(room_id)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(ClientError::Connect(format!(
                    "no connection to room {} within {:?}",
                    room_id, self.config.connect_timeout
                )));
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message_id,
            Pending {
                conn_id: conn.id,
                attempt,
                tx,
            },
        );

        match timeout(self.config.response_timeout, conn.sender.send_text(payload.to_string())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(&message_id);
                self.on_transport_failure(&conn, &e.to_string()).await;
                return Err(e);
            }
            Err(_) => {
                self.pending.remove_if(&message_id, |_, p| p.attempt == attempt);
                self.on_transport_failure(&conn, "outbound write stalled").await;
                return Err(ClientError::Timeout(self.config.response_timeout));
            }
        }

        match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Transport("pending request dropped".to_string())),
            Err(_) => {
                // A late ack for this attempt must not resolve a later one
                self.pending.remove_if(&message_id, |_, p| p.attempt == attempt);
                Err(ClientError::Timeout(self.config.response_timeout))
            }
        }
    }

    /// The room's live connection, opening one if there is none.
    async fn connection(self: &Arc<Self>, room_id: &str) -> Result<Arc<Connection>, ClientError> {
        let slot = self.slots.entry(room_id.to_string()).or_default().clone();
        let mut slot = slot.lock().await;
        if let Some(conn) = slot.conn.as_ref() {
            return Ok(conn.clone());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let link = self.connector.connect(room_id).await?;
        let conn = Arc::new(Connection {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            room_id: room_id.to_string(),
            sender: link.sender,
        });

        if slot.opened > 0 {
            self.reconnections.fetch_add(1, Ordering::Relaxed);
        }
        slot.opened += 1;
        slot.conn = Some(conn.clone());
        self.live_connections.fetch_add(1, Ordering::Relaxed);

        info!(room_id = %room_id, connection_id = conn.id, "Room connection opened");
        tokio::spawn(read_loop(self.clone(), conn.clone(), link.events));
        Ok(conn)
    }

    fn dispatch(&self, conn: &Connection, text: &str) {
        match InboundFrame::classify(text) {
            Ok(InboundFrame::Ack(ack)) => match self.pending.remove(&ack.message_id) {
                Some((_, pending)) => {
                    let _ = pending.tx.send(Ok(ack));
                }
                None => {
                    debug!(message_id = %ack.message_id, "Acknowledgment with no pending request");
                }
            },
            Ok(InboundFrame::Broadcast(raw)) => match serde_json::from_str::<ChatMessage>(&raw) {
                Ok(message) => {
                    debug!(
                        room_id = %conn.room_id,
                        message_id = %message.message_id,
                        "Broadcast received on send connection"
                    );
                    let _ = self.broadcasts.send(message);
                }
                Err(e) => {
                    warn!(room_id = %conn.room_id, error = %e, "Unrecognized broadcast frame");
                }
            },
            Err(e) => {
                warn!(room_id = %conn.room_id, error = %e, "Malformed inbound frame");
            }
        }
    }

    /// Evict `conn` if it is still the room's connection and fail the
    /// pending requests in scope. Only the first caller for a connection
    /// fails anything.
    async fn on_transport_failure(&self, conn: &Arc<Connection>, reason: &str) {
        let evicted = match self.slots.get(&conn.room_id).map(|s| s.value().clone()) {
            Some(slot) => {
                let mut slot = slot.lock().await;
                if slot.conn.as_ref().is_some_and(|c| c.id == conn.id) {
                    slot.conn = None;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if !evicted {
            return;
        }

        self.live_connections.fetch_sub(1, Ordering::Relaxed);
        client_metrics::record_connection_evicted(&conn.room_id);

        let scope = self.config.failure_scope;
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| scope == FailureScope::Process || e.value().conn_id == conn.id)
            .map(|e| *e.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(ClientError::Transport(reason.to_string())));
                failed += 1;
            }
        }

        warn!(
            room_id = %conn.room_id,
            connection_id = conn.id,
            reason = %reason,
            failed_pending = failed,
            scope = ?scope,
            "Room connection evicted"
        );

        self.close_link(conn).await;
    }

    /// Close a link without letting a stuck socket hold up the caller.
    async fn close_link(&self, conn: &Connection) {
        if timeout(self.config.connect_timeout, conn.sender.close()).await.is_err() {
            debug!(room_id = %conn.room_id, connection_id = conn.id, "Link close timed out");
        }
    }
}

async fn read_loop(inner: Arc<EngineInner>, conn: Arc<Connection>, mut events: mpsc::Receiver<LinkEvent>) {
    let reason = loop {
        match events.recv().await {
            Some(LinkEvent::Frame(text)) => inner.dispatch(&conn, &text),
            Some(LinkEvent::TransportError(e)) => break e,
            Some(LinkEvent::Closed) | None => break "connection closed".to_string(),
        }
    };
    inner.on_transport_failure(&conn, &reason).await;
}
