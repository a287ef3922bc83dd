// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Room registry: per-room page lists and snapshot storage.
//!
//! The registry is a dumb store of "last full frame" per page. It never
//! interprets strokes; incremental drawing is relayed peer-to-peer through
//! the router and only the wholesale snapshots land here. Consistency model
//! is last-writer-wins by arrival order at the server.
//!
//! Every operation completes while holding the map guard for its room, with
//! no intervening await, so concurrent structural changes to the same room
//! cannot interleave mid-mutation.

use dashmap::DashMap;
use metrics::{counter, gauge};

use crate::error::AppError;
use sketchsync_common::PageSnapshot;

pub type RoomId = String;

#[derive(Debug, Clone)]
pub struct Page {
    pub id: String,
    pub image_data: Option<String>,
}

impl Page {
    fn snapshot(&self) -> PageSnapshot {
        PageSnapshot {
            id: self.id.clone(),
            image_data: self.image_data.clone(),
        }
    }
}

/// State held for one live room. Participant membership lives in the
/// presence tracker; this is only the shared drawing surface.
#[derive(Debug)]
pub struct Room {
    /// Insertion-ordered page list; append-only, never reordered,
    /// never empty while the room exists
    pages: Vec<Page>,
    /// Monotonic clock for server-assigned chat timestamps
    last_chat_ts: i64,
    /// High-water mark over every page id ever issued for this room, so a
    /// removed page's id can never be reissued
    last_page_id: i64,
}

impl Room {
    fn new() -> Self {
        let mut room = Room {
            pages: Vec::new(),
            last_chat_ts: 0,
            last_page_id: 0,
        };
        let id = room.fresh_page_id();
        room.pages.push(Page {
            id,
            image_data: None,
        });
        room
    }

    /// Timestamp-derived page id, strictly greater than every id this room
    /// has ever issued. Ids of removed pages stay burned.
    fn fresh_page_id(&mut self) -> String {
        let id = chrono::Utc::now()
            .timestamp_millis()
            .max(self.last_page_id + 1);
        self.last_page_id = id;
        id.to_string()
    }

    fn snapshots(&self) -> Vec<PageSnapshot> {
        self.pages.iter().map(Page::snapshot).collect()
    }
}

/// Process-wide map from room id to room state. Created lazily on first
/// join, deleted by the presence teardown path when the last participant
/// leaves.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        RoomRegistry {
            rooms: DashMap::new(),
        }
    }

    /// Create the room with a single default page if it does not exist yet.
    pub fn ensure_room(&self, room_id: &str) {
        let mut created = false;
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            Room::new()
        });
        if created {
            tracing::info!(room_id, "room created");
            counter!(crate::metrics::ROOM_CREATED).increment(1);
            gauge!(crate::metrics::ROOM_ACTIVE).increment(1.0);
        }
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Append a fresh page, storing the preceding page's final snapshot in
    /// the same operation. The client transmits that snapshot only at the
    /// moment of paging, so this is the last chance to capture it.
    ///
    /// An unknown preceding page id still appends; only the snapshot
    /// backfill is skipped.
    pub fn add_page(
        &self,
        room_id: &str,
        preceding_page_id: &str,
        preceding_image_data: String,
    ) -> Result<Vec<PageSnapshot>, AppError> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| AppError::RoomNotFound(room_id.to_string()))?;

        match room.pages.iter_mut().find(|p| p.id == preceding_page_id) {
            Some(preceding) => preceding.image_data = Some(preceding_image_data),
            None => {
                tracing::warn!(
                    room_id,
                    page_id = preceding_page_id,
                    "addPage names an unknown preceding page, skipping snapshot"
                );
            },
        }

        let id = room.fresh_page_id();
        room.pages.push(Page {
            id,
            image_data: None,
        });

        Ok(room.snapshots())
    }

    /// Remove a page. The last remaining page is protected: the list is
    /// left unchanged and the caller gets a typed rejection rather than a
    /// panic that could take the handler down.
    pub fn remove_page(
        &self,
        room_id: &str,
        page_id: &str,
    ) -> Result<Vec<PageSnapshot>, AppError> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| AppError::RoomNotFound(room_id.to_string()))?;

        if !room.pages.iter().any(|p| p.id == page_id) {
            return Err(AppError::PageNotFound(page_id.to_string()));
        }
        if room.pages.len() == 1 {
            return Err(AppError::LastPage);
        }

        room.pages.retain(|p| p.id != page_id);
        Ok(room.snapshots())
    }

    /// Replace a page's stored snapshot, last-writer-wins. Returns `false`
    /// (and mutates nothing) for an unknown room or page; the room may
    /// legitimately have been torn down since the client captured the frame.
    pub fn update_page_state(&self, room_id: &str, page_id: &str, image_data: String) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        match room.pages.iter_mut().find(|p| p.id == page_id) {
            Some(page) => {
                page.image_data = Some(image_data);
                true
            },
            None => false,
        }
    }

    /// Full current page list with snapshots, used to seed a newly joined
    /// or refreshed client.
    pub fn initial_state(&self, room_id: &str) -> Option<Vec<PageSnapshot>> {
        self.rooms.get(room_id).map(|room| room.snapshots())
    }

    /// Server-assigned chat timestamp, strictly greater than the previous
    /// one handed out for this room.
    pub fn stamp_chat(&self, room_id: &str) -> Option<i64> {
        let mut room = self.rooms.get_mut(room_id)?;
        let now = chrono::Utc::now().timestamp_millis();
        let stamp = now.max(room.last_chat_ts + 1);
        room.last_chat_ts = stamp;
        Some(stamp)
    }

    /// Drop a room entirely. Called when its last participant leaves.
    pub fn remove_room(&self, room_id: &str) {
        if self.rooms.remove(room_id).is_some() {
            tracing::info!(room_id, "room deleted");
            counter!(crate::metrics::ROOM_DELETED).increment(1);
            gauge!(crate::metrics::ROOM_ACTIVE).decrement(1.0);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
