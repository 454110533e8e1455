//! Underlying per-room links
//!
//! A [`Connector`] opens one link for a room. The link is split into a
//! [`LinkSender`] for outbound frames and a stream of [`LinkEvent`]s that
//! ends after a `TransportError` or `Closed`.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    TransportError(String),
    Closed,
}

#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), ClientError>;

    async fn close(&self);
}

pub struct Link {
    pub sender: Arc<dyn LinkSender>,
    pub events: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, room_id: &str) -> Result<Link, ClientError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `<base_url>/<room_id>` over WebSocket.
pub struct WsConnector {
    base_url: String,
    event_buffer: usize,
}

impl WsConnector {
    /// `base_url` such as `ws://localhost:8080/chat`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            event_buffer: 1024,
        }
    }
}

struct WsLinkSender {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl LinkSender for WsLinkSender {
    async fn send_text(&self, text: String) -> Result<(), ClientError> {
        self.sink
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, room_id: &str) -> Result<Link, ClientError> {
        let url = format!("{}/{}", self.base_url, room_id);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Connect(format!("{}: {}", url, e)))?;
        debug!(%url, "WebSocket connected");

        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel(self.event_buffer);

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => LinkEvent::Frame(text.as_str().to_owned()),
                    Ok(Message::Close(_)) => LinkEvent::Closed,
                    Ok(_) => continue,
                    Err(e) => LinkEvent::TransportError(e.to_string()),
                };
                let terminal = !matches!(event, LinkEvent::Frame(_));
                if tx.send(event).await.is_err() || terminal {
                    return;
                }
            }
            let _ = tx.send(LinkEvent::Closed).await;
        });

        Ok(Link {
            sender: Arc::new(WsLinkSender {
                sink: Mutex::new(sink),
            }),
            events: rx,
        })
    }
}
