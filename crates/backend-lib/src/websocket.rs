// ============================
// crates/backend-lib/src/websocket.rs
// ============================
//! Per-session event routing.
//!
//! One `SessionHandler` lives for the duration of a WebSocket connection.
//! It owns the session's room membership and turns each validated client
//! message into targeted replies (returned to the caller) and room
//! broadcasts (fanned out through the shared state). The transport loop in
//! `ws_router` owns the socket itself.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ai::{self, VisionModel};
use crate::error::AppError;
use crate::{AppState, RoomSender};
use sketchsync_common::{
    ClientMessage, DrawBroadcast, ServerMessage, COMPOSITE_DRAW, COMPOSITE_ERASE,
};

pub struct SessionHandler<M> {
    state: Arc<AppState<M>>,
    session_id: Uuid,
    /// Outbound channel for this session, registered per room on join
    tx: mpsc::Sender<ServerMessage>,
    joined_room: Option<String>,
}

impl<M: VisionModel> SessionHandler<M> {
    pub fn new(
        state: Arc<AppState<M>>,
        session_id: Uuid,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Self {
        SessionHandler {
            state,
            session_id,
            tx,
            joined_room: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Route one already-validated message. The return value, if any, is a
    /// targeted reply for this session only; broadcasts happen inside.
    pub fn handle_message(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::JoinRoom { room_id, user_id } => {
                self.handle_join(room_id, user_id)
            },

            ClientMessage::Draw(event) => {
                let room_id = event.room_id.clone();
                let composite_operation = if event.is_erasing == Some(true) {
                    COMPOSITE_ERASE
                } else {
                    COMPOSITE_DRAW
                };
                let broadcast = ServerMessage::Draw(DrawBroadcast {
                    event,
                    composite_operation: composite_operation.to_string(),
                });
                self.state.broadcast(&room_id, &broadcast, None);
                counter!(crate::metrics::DRAW_RELAYED).increment(1);
                None
            },

            ClientMessage::EndStroke {
                room_id,
                stroke_id,
                page,
            } => {
                let broadcast = ServerMessage::EndStroke {
                    room_id: room_id.clone(),
                    stroke_id,
                    page,
                };
                self.state.broadcast(&room_id, &broadcast, None);
                None
            },

            ClientMessage::ClearCanvas { room_id, sender_id } => {
                let broadcast = ServerMessage::ClearCanvas {
                    room_id: room_id.clone(),
                    sender_id,
                };
                self.state.broadcast(&room_id, &broadcast, None);
                None
            },

            ClientMessage::AddPage {
                room_id,
                page_id,
                image_data,
            } => {
                match self.state.registry.add_page(&room_id, &page_id, image_data) {
                    Ok(pages) => {
                        self.broadcast_pages(&room_id, pages);
                        None
                    },
                    Err(e) => Some(self.reject(&room_id, "addPage", e)),
                }
            },

            ClientMessage::RemovePage { room_id, page_id } => {
                match self.state.registry.remove_page(&room_id, &page_id) {
                    Ok(pages) => {
                        self.broadcast_pages(&room_id, pages);
                        None
                    },
                    Err(e) => Some(self.reject(&room_id, "removePage", e)),
                }
            },

            ClientMessage::UpdatePageState {
                room_id,
                page_id,
                image_data,
            } => {
                // Silent backfill. The room may have been torn down since
                // the client captured the frame, so a miss is not an error.
                if !self.state.registry.update_page_state(&room_id, &page_id, image_data) {
                    tracing::debug!(room_id, page_id, "page state update for unknown target");
                }
                None
            },

            ClientMessage::RequestInitialState { room_id } => {
                match self.state.registry.initial_state(&room_id) {
                    Some(pages) => Some(ServerMessage::InitialState { room_id, pages }),
                    None => Some(self.reject(
                        &room_id,
                        "requestInitialState",
                        AppError::RoomNotFound(room_id.clone()),
                    )),
                }
            },

            ClientMessage::ChatMessage {
                room_id,
                username,
                message,
            } => {
                let max = self.state.settings.chat.max_message_len;
                let body = crate::validation::truncate_chat(&message, max).to_string();

                // Unknown room means the sender never joined; drop quietly.
                let Some(timestamp) = self.state.registry.stamp_chat(&room_id) else {
                    tracing::warn!(room_id, "chat for unknown room dropped");
                    return None;
                };

                let broadcast = ServerMessage::ChatMessage {
                    room_id: room_id.clone(),
                    username,
                    message: body,
                    timestamp,
                };
                self.state.broadcast(&room_id, &broadcast, None);
                counter!(crate::metrics::CHAT_RELAYED).increment(1);
                None
            },

            ClientMessage::AiSubmit {
                room_id,
                image,
                prompt,
            } => {
                // A submission for a room nobody inhabits must not reach the
                // gate: it would spend model quota for an audience of zero
                // and leave a cooldown slot keyed by an arbitrary string.
                if !self.state.registry.contains(&room_id) {
                    return Some(self.reject(
                        &room_id,
                        "aiSubmit",
                        AppError::RoomNotFound(room_id.clone()),
                    ));
                }
                counter!(crate::metrics::AI_SUBMISSION).increment(1);
                let state = Arc::clone(&self.state);
                // The relay keeps serving draw traffic while the model runs;
                // the outcome is broadcast whenever it lands. If the room was
                // torn down in the meantime the broadcast is a no-op.
                tokio::spawn(async move {
                    let outcome = state.ai.submit(&room_id, &image, prompt.as_deref()).await;
                    let broadcast = match outcome {
                        Ok(response) => ServerMessage::AiResponse {
                            room_id: room_id.clone(),
                            response,
                        },
                        Err(failure) => {
                            ai::record_failure(&failure);
                            ServerMessage::AiError {
                                room_id: room_id.clone(),
                                message: failure.user_message().to_string(),
                            }
                        },
                    };
                    state.broadcast(&room_id, &broadcast, None);
                });
                None
            },
        }
    }

    fn handle_join(
        &mut self,
        room_id: String,
        user_id: Option<String>,
    ) -> Option<ServerMessage> {
        let outcome = match self.state.presence.join(
            &room_id,
            self.session_id,
            user_id.as_deref(),
            self.state.settings.room.max_participants,
        ) {
            Ok(outcome) => outcome,
            Err(e) => return Some(self.reject(&room_id, "joinRoom", e)),
        };

        self.state.registry.ensure_room(&room_id);
        self.state.register_sender(
            &room_id,
            RoomSender {
                session_id: self.session_id,
                tx: self.tx.clone(),
            },
        );
        self.joined_room = Some(room_id.clone());

        if outcome.newly_visible {
            tracing::info!(
                room_id,
                session_id = %self.session_id,
                participants = outcome.participants,
                "user joined"
            );
            self.state.broadcast(
                &room_id,
                &ServerMessage::UserJoined {
                    room_id: room_id.clone(),
                    user_id,
                    participants: outcome.participants,
                },
                Some(self.session_id),
            );
        }

        Some(ServerMessage::RoomStatus {
            room_id,
            participants: outcome.participants,
        })
    }

    fn broadcast_pages(&self, room_id: &str, pages: Vec<sketchsync_common::PageSnapshot>) {
        self.state.broadcast(
            room_id,
            &ServerMessage::FullPageUpdate {
                room_id: room_id.to_string(),
                pages,
            },
            None,
        );
    }

    fn reject(&self, room_id: &str, operation: &str, e: AppError) -> ServerMessage {
        tracing::warn!(
            room_id,
            session_id = %self.session_id,
            operation,
            error = %e,
            "operation rejected"
        );
        ServerMessage::Error {
            code: e.error_code().to_string(),
            message: e.sanitized_message(),
        }
    }

    /// Disconnect cleanup: withdraw the outbound channel, update presence,
    /// announce departures, and tear down rooms left empty.
    ///
    /// Registry and fan-out deletion happens inside the presence callback,
    /// under the same guard that admits joins for the room id, so a join
    /// racing this teardown either lands before the emptiness decision or
    /// waits and rebuilds the room whole. It can never observe a room whose
    /// registry entry is gone while its presence entry survives.
    pub fn teardown(&mut self) {
        self.state.unregister_sender(self.session_id);

        let state = &self.state;
        let outcomes = state.presence.leave_all(self.session_id, |room_id| {
            state.registry.remove_room(room_id);
            state.clients.remove(room_id);
            state.ai.forget_room(room_id);
        });

        for outcome in outcomes {
            if outcome.user_left && !outcome.room_empty {
                // The member key is the durable user id when one was given,
                // else the session id string, which clients never see as an id.
                let user_id = (outcome.user_key != self.session_id.to_string())
                    .then_some(outcome.user_key.clone());
                self.state.broadcast(
                    &outcome.room_id,
                    &ServerMessage::UserLeft {
                        room_id: outcome.room_id.clone(),
                        user_id,
                        participants: outcome.participants,
                    },
                    None,
                );
            }
        }
        self.joined_room = None;
    }

    pub fn joined_room(&self) -> Option<&str> {
        self.joined_room.as_deref()
    }
}
