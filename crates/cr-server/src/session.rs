//! Room -> live connection registry
//!
//! Each room maps to at most one connection; the latest registration wins.
//! Outbound frames for a connection go through a single writer task, so acks
//! and broadcasts to one socket never interleave mid-frame.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::server_metrics;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("session send timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    room_id: String,
    client_ip: Option<String>,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(room_id: impl Into<String>, client_ip: Option<String>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            room_id: room_id.into(),
            client_ip,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Queue a text frame, waiting up to `timeout` for room in the writer queue.
    pub async fn send(&self, text: String, timeout: Duration) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        match self.tx.send_timeout(Outbound::Text(text), timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SessionError::Closed),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SessionError::Timeout(timeout)),
        }
    }

    /// Mark closed and ask the writer task to close the socket. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(Outbound::Close);
        }
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    closing: watch::Sender<bool>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
            closing: watch::channel(false).0,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` for its room, replacing any previous entry.
    pub fn register(&self, session: SessionHandle) -> Option<SessionHandle> {
        let room_id = session.room_id.clone();
        let previous = self.sessions.insert(room_id.clone(), session);
        if let Some(prev) = &previous {
            debug!(room_id = %room_id, replaced = prev.id, "Replaced room session");
        }
        server_metrics::set_active_sessions(self.sessions.len());
        previous
    }

    pub fn get(&self, room_id: &str) -> Option<SessionHandle> {
        self.sessions.get(room_id).map(|entry| entry.value().clone())
    }

    /// Remove the room entry only if it still belongs to `session_id`.
    pub fn remove_if_current(&self, room_id: &str, session_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(room_id, |_, current| current.id == session_id)
            .is_some();
        if removed {
            server_metrics::set_active_sessions(self.sessions.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Flips to `true` once [`close_all`](Self::close_all) has been called.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Close every registered session and tell all connections, including
    /// replaced ones, to shut down. Returns the number of sessions closed.
    pub fn close_all(&self) -> usize {
        self.closing.send_replace(true);
        let mut closed = 0;
        for entry in self.sessions.iter() {
            entry.value().close();
            closed += 1;
        }
        closed
    }
}
