// ================
// crates/common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between sketchsync clients and the relay server.
//! This module defines the WebSocket protocol messages and supporting types.

use serde::{Deserialize, Serialize};

/// Canvas composite operation used to replay an erasing stroke.
pub const COMPOSITE_ERASE: &str = "destination-out";
/// Canvas composite operation used to replay an ordinary stroke.
pub const COMPOSITE_DRAW: &str = "source-over";

/// One point-to-point segment of a stroke.
///
/// Every draw event is self-contained: a receiver can replay it against a
/// blank canvas using only these fields, without any per-sender cursor state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrawEvent {
    /// Room the stroke belongs to
    pub room_id: String,
    /// Opaque id of the drawing client
    pub sender_id: String,
    /// Current point
    pub x: f64,
    pub y: f64,
    /// Previous point of the same stroke
    pub prev_x: f64,
    pub prev_y: f64,
    /// Stroke color as `#RRGGBB`
    pub color: String,
    /// Brush width in canvas pixels
    pub line_width: f64,
    /// Page index the stroke targets
    pub page: u32,
    /// Set when the eraser tool produced this segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_erasing: Option<bool>,
    /// Identifier of the stroke this segment belongs to (sender id + timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_id: Option<String>,
    /// Set when a hand-gesture recognizer produced this segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_gesture: Option<bool>,
}

/// A page as seen by clients: its id and the last known raster snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    /// Page id, unique within its room
    pub id: String,
    /// Last full-frame snapshot as a data URI; `None` until one arrives
    pub image_data: Option<String>,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a room, creating it on first join
    /// # Fields
    /// * `room_id` - Client-chosen room token
    /// * `user_id` - Optional durable id that survives reconnects; used to
    ///   deduplicate the participant count
    JoinRoom {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    /// One stroke segment, relayed verbatim plus a derived composite operation
    Draw(DrawEvent),
    /// End of a continuous drag; receivers drop per-stroke state for `stroke_id`
    EndStroke {
        room_id: String,
        stroke_id: String,
        page: u32,
    },
    /// Wipe the sender's current page on every client
    ClearCanvas {
        room_id: String,
        sender_id: String,
    },
    /// Append a page; `page_id` names the page being switched away from and
    /// `image_data` is its final snapshot
    AddPage {
        room_id: String,
        page_id: String,
        image_data: String,
    },
    /// Remove a page (the last remaining page is protected)
    RemovePage {
        room_id: String,
        page_id: String,
    },
    /// Replace a page's stored snapshot; silent backfill, no broadcast
    UpdatePageState {
        room_id: String,
        page_id: String,
        image_data: String,
    },
    /// One-shot request for the full page list, answered only to the requester
    RequestInitialState {
        room_id: String,
    },
    /// Chat fan-out; the server truncates the body and assigns the timestamp
    ChatMessage {
        room_id: String,
        username: String,
        message: String,
    },
    /// Submit the current sketch to the vision model
    #[serde(alias = "processWithAI")]
    AiSubmit {
        room_id: String,
        /// Encoded still image as a `data:image/...;base64,...` URI
        image: String,
        #[serde(default)]
        prompt: Option<String>,
    },
}

impl ClientMessage {
    /// Room id carried by the message, if any.
    pub fn room_id(&self) -> &str {
        match self {
            ClientMessage::JoinRoom { room_id, .. }
            | ClientMessage::EndStroke { room_id, .. }
            | ClientMessage::ClearCanvas { room_id, .. }
            | ClientMessage::AddPage { room_id, .. }
            | ClientMessage::RemovePage { room_id, .. }
            | ClientMessage::UpdatePageState { room_id, .. }
            | ClientMessage::RequestInitialState { room_id }
            | ClientMessage::ChatMessage { room_id, .. }
            | ClientMessage::AiSubmit { room_id, .. } => room_id,
            ClientMessage::Draw(ev) => &ev.room_id,
        }
    }
}

/// A relayed draw event with the server-resolved composite operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrawBroadcast {
    #[serde(flatten)]
    pub event: DrawEvent,
    /// `destination-out` for erasing strokes, else `source-over`
    pub composite_operation: String,
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Targeted reply to a successful join
    RoomStatus {
        room_id: String,
        participants: usize,
    },
    /// Broadcast to the rest of the room when a distinct user appears
    UserJoined {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        participants: usize,
    },
    /// Broadcast when a distinct user's last session leaves
    UserLeft {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        participants: usize,
    },
    /// Stroke segment relay
    Draw(DrawBroadcast),
    EndStroke {
        room_id: String,
        stroke_id: String,
        page: u32,
    },
    ClearCanvas {
        room_id: String,
        sender_id: String,
    },
    /// Full ordered page list, broadcast after any structural page change
    FullPageUpdate {
        room_id: String,
        pages: Vec<PageSnapshot>,
    },
    /// Targeted reply seeding a newly joined or refreshed client
    InitialState {
        room_id: String,
        pages: Vec<PageSnapshot>,
    },
    /// Chat relay with the server-assigned millisecond timestamp
    ChatMessage {
        room_id: String,
        username: String,
        message: String,
        timestamp: i64,
    },
    /// Vision model answer, broadcast room-wide
    AiResponse {
        room_id: String,
        response: String,
    },
    /// Sanitized vision model failure, broadcast room-wide
    AiError {
        room_id: String,
        message: String,
    },
    /// Targeted error for request/response events
    Error {
        code: String,
        message: String,
    },
}
