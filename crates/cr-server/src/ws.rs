//! WebSocket endpoint: one connection per room subscriber/sender

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use cr_common::room_id_fits;

use crate::app::AppState;
use crate::ingress::{ConnectionEvent, IngressHandler};
use crate::session::{Outbound, SessionHandle};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !room_id_fits(&room_id) {
        debug!(room_len = room_id.len(), "Rejecting over-long room path");
        return (StatusCode::BAD_REQUEST, "roomId too long").into_response();
    }
    let ingress = state.ingress.clone();
    let buffer = state.session_buffer;
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, addr.ip().to_string(), ingress, buffer))
}

async fn handle_socket(
    socket: WebSocket,
    room_id: String,
    client_ip: String,
    ingress: Arc<IngressHandler>,
    buffer: usize,
) {
    let mut closing = ingress.registry().closing();
    if *closing.borrow_and_update() {
        debug!(%room_id, "Refusing connection during shutdown");
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(buffer.max(1));
    let session = SessionHandle::new(room_id, Some(client_ip), tx);

    // Single writer per socket
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    ingress.handle(&session, ConnectionEvent::Opened).await;

    let mut shutting_down = false;
    let writer_done = loop {
        let frame = tokio::select! {
            _ = &mut writer => break true,
            _ = closing.changed(), if !shutting_down => {
                shutting_down = true;
                session.close();
                continue;
            }
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                ingress.handle(&session, ConnectionEvent::Text(text.as_str())).await;
            }
            Some(Ok(Message::Close(_))) | None => break false,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                ingress
                    .handle(&session, ConnectionEvent::TransportError(e.to_string()))
                    .await;
                break false;
            }
        }
        if !session.is_open() {
            break false;
        }
    };

    ingress.handle(&session, ConnectionEvent::Closed).await;
    drop(session);

    if !writer_done && tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!("Socket writer did not finish after close");
    }
}
