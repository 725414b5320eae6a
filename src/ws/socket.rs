use std::sync::Arc;
use axum::{
    extract::{Query, State, ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade}},
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::services::auth_service::get_handshake_token;
use crate::state::AppState;
use crate::ws::outbox::Outbound;
use crate::ws::protocol::ProtocolHandler;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    info!("New WebSocket connection attempt");
    let token = get_handshake_token(query.token.as_deref(), &headers);
    let protocol = state.protocol.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, protocol, token))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, protocol: Arc<ProtocolHandler>, token: Option<String>) {
    let (mut session, mut outbound) = protocol.open(token).await;
    let conn_id = session.conn_id().to_string();

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Drain this connection's outbox into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Message(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode {} event: {}", message.kind(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Frames of one connection are handled strictly in order
    let read_loop = async {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => protocol.handle_text(&mut session, &text).await,
                Ok(Message::Binary(_)) => protocol.reject_frame(&session, "Binary frames are not supported"),
                Ok(Message::Close(_)) => break,
                // Ping/Pong is answered by the transport
                Ok(_) => {}
                Err(e) => {
                    debug!("Socket error on {}: {}", session.conn_id(), e);
                    break;
                }
            }
        }
    };

    // Wait for either side to finish
    tokio::select! {
        _ = read_loop => {},
        _ = (&mut send_task) => {},
    };
    send_task.abort();

    protocol.disconnect(&mut session, "socket closed").await;
    info!("WebSocket connection {} terminated", conn_id);
}
