// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
//!
//! Owns the socket lifecycle: upgrade, the outbound forward task, the
//! inbound parse/validate/dispatch loop, and disconnect cleanup. Everything
//! room-related is delegated to `SessionHandler`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::ai::VisionModel;
use crate::validation;
use crate::websocket::SessionHandler;
use crate::AppState;
use sketchsync_common::{ClientMessage, ServerMessage};

/// Outbound queue depth per connection. A receiver further behind than this
/// starts losing broadcasts rather than stalling the room.
const OUTBOUND_QUEUE: usize = 64;

/// Create the application router.
pub fn create_router<M: VisionModel>(state: Arc<AppState<M>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Handler for WebSocket connections
pub async fn ws_handler<M: VisionModel>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<M>>>,
) -> impl IntoResponse {
    counter!(crate::metrics::WS_CONNECTION).increment(1);
    gauge!(crate::metrics::WS_ACTIVE).increment(1.0);

    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection<M: VisionModel>(socket: WebSocket, state: Arc<AppState<M>>) {
    let session_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();

    // Outbound path: everything for this client funnels through one channel,
    // whether it is a targeted reply or a room broadcast.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);

    let send_task = tokio::spawn(async move {
        while let Some(server_msg) = rx.recv().await {
            let json = match serde_json::to_string(&server_msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "outbound message failed to serialize");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut handler = SessionHandler::new(Arc::clone(&state), session_id, tx.clone());
    tracing::debug!(session_id = %session_id, "websocket session opened");

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                // Malformed frames are dropped without an echo; anything the
                // server sent back here would itself be attacker-controlled.
                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %e,
                            "dropping malformed frame"
                        );
                        continue;
                    },
                };

                if let Err(e) =
                    validation::validate_client_message(&client_msg, &state.settings)
                {
                    counter!(crate::metrics::VALIDATION_REJECTED).increment(1);
                    tracing::warn!(
                        session_id = %session_id,
                        room_id = client_msg.room_id(),
                        error = %e,
                        "dropping invalid message"
                    );
                    continue;
                }

                if let Some(reply) = handler.handle_message(client_msg) {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            // Pings are answered by axum itself; binary frames are not part
            // of the protocol.
            _ => {},
        }
    }

    handler.teardown();
    tracing::debug!(session_id = %session_id, "websocket session closed");
    gauge!(crate::metrics::WS_ACTIVE).decrement(1.0);
    send_task.abort();
}
