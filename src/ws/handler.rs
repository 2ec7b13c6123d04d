use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::ws::{ClientMessage, RelayKind, ServerMessage};

/// WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one signaling connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let reply_tx = tx.clone();
    let conn_id = state.registry.connect(tx);

    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    // Outbox: everything the registry (or this handler) wants delivered to
    // this client goes through one channel and one writer task.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize server message"),
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => handle_message(&text, conn_id, &reply_tx, &state),
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close received");
                break;
            }
            Err(e) => {
                tracing::error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    tracing::info!(conn_id = %conn_id, "WebSocket disconnected, cleaning up");

    // A dropped transport is a normal lifecycle event, not an error: the
    // registry broadcasts `bye` to whoever shared a room with this member.
    state.registry.disconnect(conn_id);
    send_task.abort();
}

/// Decode one inbound frame and drive the registry. A malformed or
/// out-of-protocol frame is logged and skipped; it never tears down the
/// connection or touches other rooms.
fn handle_message(
    text: &str,
    conn_id: Uuid,
    reply_tx: &mpsc::UnboundedSender<ServerMessage>,
    state: &AppState,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "Invalid signaling frame");
            return;
        }
    };

    match msg {
        ClientMessage::JoinRoom {
            room_name,
            nickname,
        } => {
            let reply = match state.registry.join(conn_id, &room_name, &nickname) {
                Ok(()) => ServerMessage::Joined { room_name },
                Err(e) => {
                    let code = match e {
                        AppError::RoomFull => 409,
                        _ => 400,
                    };
                    ServerMessage::error(code, &e.to_string())
                }
            };
            let _ = reply_tx.send(reply);
        }
        ClientMessage::Offer { payload, room_name } => {
            state
                .registry
                .relay(conn_id, RelayKind::Offer, payload, &room_name);
        }
        ClientMessage::Answer { payload, room_name } => {
            state
                .registry
                .relay(conn_id, RelayKind::Answer, payload, &room_name);
        }
        ClientMessage::Ice { payload, room_name } => {
            state
                .registry
                .relay(conn_id, RelayKind::Ice, payload, &room_name);
        }
    }
}
