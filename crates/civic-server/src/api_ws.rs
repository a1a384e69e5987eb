//! Live connection adapter.
//!
//! `GET /ws?token=<token>` checks the signed token (see [`crate::ws_token`]),
//! resolves the bound user once through the identity store, registers the socket with the hub (which auto-joins `user:<id>`
//! and, for staff and admins, the staff topic), and forwards every hub push
//! to the socket. Clients may then send:
//!
//! ```json
//! {"type": "subscribe", "ticketId": "..."}
//! {"type": "unsubscribe", "ticketId": "..."}
//! ```
//!
//! Subscriptions are visibility-checked: a resident can only watch their own
//! tickets. The hub forgets the connection as soon as the socket ends.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::authz::Actor;
use crate::error::ServiceError;
use crate::AppState;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "ticketId")]
        ticket_id: String,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        #[serde(rename = "ticketId")]
        ticket_id: String,
    },
}

/// Replies to client frames. Hub events use their own envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "ticketId")]
        ticket_id: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        #[serde(rename = "ticketId")]
        ticket_id: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Handler for `GET /ws`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        tracing::warn!("websocket connect missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let user_id = match state.tokens.verify(&token) {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::warn!("websocket token verification failed: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    match state.service.authenticate(&user_id).await {
        Ok(actor) => {
            tracing::info!(user_id = %actor.id, role = %actor.role, "websocket auth success");
            ws.on_upgrade(move |socket| handle_socket(socket, state, actor))
        }
        Err(ServiceError::Unauthorized) => {
            tracing::warn!(user_id = %user_id, "websocket auth failed");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, "websocket auth internal error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Queues a reply frame for this connection only.
fn send_frame(tx: &mpsc::Sender<String>, frame: &OutgoingMessage) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if let Err(e) = tx.try_send(json) {
                tracing::warn!("failed to queue websocket reply: {}", e);
            }
        }
        Err(e) => {
            tracing::error!("failed to serialize websocket reply: {}", e);
        }
    }
}

fn send_ws_error(tx: &mpsc::Sender<String>, message: String) {
    send_frame(tx, &OutgoingMessage::Error { message });
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, actor: Actor) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow client loses events instead of growing memory.
    let (tx, mut rx) = mpsc::channel::<String>(state.connection_buffer);

    let hub = state.service.hub();
    let connection = match hub.connect(&actor.id, actor.role, tx.clone()).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(user_id = %actor.id, "refusing live connection: {}", e);
            return;
        }
    };

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            AxumMessage::Text(text) => match serde_json::from_str::<IncomingMessage>(text.as_str())
            {
                Ok(IncomingMessage::Subscribe { ticket_id }) => {
                    match state
                        .service
                        .subscribe_ticket(&actor, connection, &ticket_id)
                        .await
                    {
                        Ok(()) => send_frame(&tx, &OutgoingMessage::Subscribed { ticket_id }),
                        Err(e) => {
                            tracing::debug!(
                                user_id = %actor.id,
                                ticket_id = %ticket_id,
                                "subscribe refused: {}",
                                e
                            );
                            send_ws_error(&tx, e.to_string());
                        }
                    }
                }
                Ok(IncomingMessage::Unsubscribe { ticket_id }) => {
                    match state.service.unsubscribe_ticket(connection, &ticket_id).await {
                        Ok(()) => send_frame(&tx, &OutgoingMessage::Unsubscribed { ticket_id }),
                        Err(e) => send_ws_error(&tx, e.to_string()),
                    }
                }
                Err(_) => {
                    tracing::warn!(user_id = %actor.id, "failed to parse incoming websocket message");
                    send_ws_error(&tx, "invalid message format".to_string());
                }
            },
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    hub.disconnect(connection).await;
    send_task.abort();
}
