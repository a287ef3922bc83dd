// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const VALIDATION_REJECTED: &str = "validation.rejected";
pub const ROOM_CREATED: &str = "room.created";
pub const ROOM_DELETED: &str = "room.deleted";
pub const ROOM_ACTIVE: &str = "room.active";
pub const DRAW_RELAYED: &str = "draw.relayed";
pub const CHAT_RELAYED: &str = "chat.relayed";
pub const AI_SUBMISSION: &str = "ai.submission";
pub const AI_FAILURE: &str = "ai.failure";
