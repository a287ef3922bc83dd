// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the sketchsync relay server.

pub mod ai;
pub mod config;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod validation;
pub mod websocket;
pub mod ws_router;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ai::{AiGate, VisionModel};
use crate::config::Settings;
use crate::presence::PresenceTracker;
use crate::registry::RoomRegistry;
use sketchsync_common::ServerMessage;

/// One registered outbound channel, keyed by the owning session.
#[derive(Clone)]
pub struct RoomSender {
    pub session_id: Uuid,
    pub tx: mpsc::Sender<ServerMessage>,
}

/// Application state shared across all connections.
pub struct AppState<M> {
    /// Settings manager
    pub settings: Arc<Settings>,
    /// Room registry: page lists and snapshots
    pub registry: RoomRegistry,
    /// Participant membership per room
    pub presence: PresenceTracker,
    /// Outbound channels per room, used for fan-out
    pub clients: DashMap<String, Vec<RoomSender>>,
    /// Gate in front of the external vision model
    pub ai: AiGate<M>,
}

impl<M: VisionModel> AppState<M> {
    /// Create a new application state around a vision model implementation.
    pub fn new(model: M, settings: Settings) -> Self {
        let settings = Arc::new(settings);
        Self {
            registry: RoomRegistry::new(),
            presence: PresenceTracker::new(),
            clients: DashMap::new(),
            ai: AiGate::new(model, Arc::clone(&settings)),
            settings,
        }
    }

    /// Register an outbound channel for a room. Re-registering the same
    /// session is a no-op.
    pub fn register_sender(&self, room_id: &str, sender: RoomSender) {
        let mut senders = self.clients.entry(room_id.to_string()).or_default();
        if !senders.iter().any(|s| s.session_id == sender.session_id) {
            senders.push(sender);
        }
    }

    /// Remove a session's outbound channel from every room it was registered
    /// under. Empty fan-out entries are dropped.
    pub fn unregister_sender(&self, session_id: Uuid) {
        self.clients
            .retain(|_, senders| {
                senders.retain(|s| s.session_id != session_id);
                !senders.is_empty()
            });
    }

    /// Fan a message out to every session in the room, optionally skipping
    /// one session. Best-effort: a full or closed channel drops the message
    /// for that receiver only.
    pub fn broadcast(&self, room_id: &str, msg: &ServerMessage, exclude: Option<Uuid>) {
        // Clone the sender list so no map guard is held while sending.
        let senders: Vec<RoomSender> = match self.clients.get(room_id) {
            Some(senders) => senders.clone(),
            None => return,
        };

        for sender in senders {
            if exclude == Some(sender.session_id) {
                continue;
            }
            if let Err(e) = sender.tx.try_send(msg.clone()) {
                tracing::debug!(
                    session_id = %sender.session_id,
                    room_id,
                    error = %e,
                    "dropping broadcast for slow or closed receiver"
                );
            }
        }
    }
}
