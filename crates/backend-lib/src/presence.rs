// ============================
// crates/backend-lib/src/presence.rs
// ============================
//! Presence tracking: distinct-user participant counts per room.
//!
//! Members are keyed by the durable client-supplied user id when one is
//! given, else by the session id. A user who reconnects with the same
//! durable id therefore holds two sessions under one key and counts once;
//! sessions without a durable id fall back to raw per-connection counting.
//!
//! A reverse index maps each session to every room it is recorded under, so
//! teardown handles the general multi-room case even though a session only
//! ever joins one room in practice.

use std::collections::HashMap;

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::AppError;

/// Result of a join: the new distinct-user count and whether the join is
/// visible (a new distinct user rather than a reconnect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participants: usize,
    pub newly_visible: bool,
}

/// Result of removing a session from one room during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: String,
    /// Member key that lost a session (durable user id or session id string)
    pub user_key: String,
    pub participants: usize,
    /// The key's last session left, so the displayed count dropped
    pub user_left: bool,
    /// No participants remain; the caller should tear the room down
    pub room_empty: bool,
}

#[derive(Default)]
struct RoomPresence {
    /// member key -> live session count
    members: HashMap<String, usize>,
}

pub struct PresenceTracker {
    rooms: DashMap<String, RoomPresence>,
    /// session id -> (room id -> member key used in that room)
    sessions: DashMap<Uuid, HashMap<String, String>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker {
            rooms: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Record a session joining a room. Idempotent per session and per
    /// distinct user: a second join from the same session is a no-op, and a
    /// reconnect under an already-present durable id does not change the
    /// displayed count.
    pub fn join(
        &self,
        room_id: &str,
        session_id: Uuid,
        user_id: Option<&str>,
        max_participants: Option<usize>,
    ) -> Result<JoinOutcome, AppError> {
        let member_key = user_id
            .map(str::to_string)
            .unwrap_or_else(|| session_id.to_string());

        {
            let mut room = self.rooms.entry(room_id.to_string()).or_default();

            let already_member = room.members.contains_key(&member_key);
            let session_already_joined = self
                .sessions
                .get(&session_id)
                .is_some_and(|rooms| rooms.contains_key(room_id));

            if session_already_joined {
                return Ok(JoinOutcome {
                    participants: room.members.len(),
                    newly_visible: false,
                });
            }

            if let Some(cap) = max_participants {
                if !already_member && room.members.len() >= cap {
                    return Err(AppError::RoomFull);
                }
            }

            *room.members.entry(member_key.clone()).or_insert(0) += 1;
            let participants = room.members.len();
            drop(room);

            self.sessions
                .entry(session_id)
                .or_default()
                .insert(room_id.to_string(), member_key);

            Ok(JoinOutcome {
                participants,
                newly_visible: !already_member,
            })
        }
    }

    /// Remove a session from every room it is recorded under, reporting one
    /// outcome per room.
    ///
    /// When a room's last participant leaves, `on_room_empty` runs while
    /// that room's presence guard is still held. The guard is what a
    /// concurrent join for the same room id blocks on, so the caller's
    /// cleanup of the room's other state either completes before the join
    /// recreates the room from scratch, or the join lands first and the
    /// room is not empty here at all. The presence entry itself is only
    /// removed if it is still empty once the guard drops.
    pub fn leave_all(
        &self,
        session_id: Uuid,
        mut on_room_empty: impl FnMut(&str),
    ) -> Vec<LeaveOutcome> {
        let Some((_, joined)) = self.sessions.remove(&session_id) else {
            return Vec::new();
        };

        let mut outcomes = Vec::with_capacity(joined.len());
        for (room_id, member_key) in joined {
            let Some(mut room) = self.rooms.get_mut(&room_id) else {
                continue;
            };

            let mut user_left = false;
            if let Some(count) = room.members.get_mut(&member_key) {
                *count -= 1;
                if *count == 0 {
                    room.members.remove(&member_key);
                    user_left = true;
                }
            }
            let participants = room.members.len();
            let room_empty = participants == 0;
            if room_empty {
                on_room_empty(&room_id);
            }
            drop(room);

            if room_empty {
                self.rooms.remove_if(&room_id, |_, room| room.members.is_empty());
            }

            outcomes.push(LeaveOutcome {
                room_id,
                user_key: member_key,
                participants,
                user_left,
                room_empty,
            });
        }
        outcomes
    }

    /// Current distinct-user count for a room.
    pub fn participants(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_count_without_durable_ids() {
        let presence = PresenceTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let out = presence.join("r1", a, None, None).unwrap();
        assert_eq!(out.participants, 1);
        assert!(out.newly_visible);

        let out = presence.join("r1", b, None, None).unwrap();
        assert_eq!(out.participants, 2);
        assert!(out.newly_visible);
    }

    #[test]
    fn test_durable_id_dedup_on_reconnect() {
        let presence = PresenceTracker::new();
        let old_tab = Uuid::new_v4();
        let new_tab = Uuid::new_v4();

        let out = presence.join("r1", old_tab, Some("alice"), None).unwrap();
        assert_eq!(out.participants, 1);
        assert!(out.newly_visible);

        // refresh: a second session under the same durable id
        let out = presence.join("r1", new_tab, Some("alice"), None).unwrap();
        assert_eq!(out.participants, 1);
        assert!(!out.newly_visible);

        // the stale session going away does not drop the count
        let outcomes = presence.leave_all(old_tab, |_| {});
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].user_left);
        assert_eq!(outcomes[0].participants, 1);

        // the last session does
        let outcomes = presence.leave_all(new_tab, |_| {});
        assert!(outcomes[0].user_left);
        assert!(outcomes[0].room_empty);
    }

    #[test]
    fn test_rejoin_same_session_is_idempotent() {
        let presence = PresenceTracker::new();
        let session = Uuid::new_v4();

        presence.join("r1", session, Some("alice"), None).unwrap();
        let out = presence.join("r1", session, Some("alice"), None).unwrap();
        assert_eq!(out.participants, 1);
        assert!(!out.newly_visible);

        // one leave fully clears the session
        let outcomes = presence.leave_all(session, |_| {});
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].room_empty);
        assert_eq!(presence.participants("r1"), 0);
    }

    #[test]
    fn test_admission_cap() {
        let presence = PresenceTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        presence.join("r1", a, Some("alice"), Some(2)).unwrap();
        presence.join("r1", b, Some("bob"), Some(2)).unwrap();

        let err = presence.join("r1", c, Some("carol"), Some(2)).unwrap_err();
        assert!(matches!(err, AppError::RoomFull));
        assert_eq!(presence.participants("r1"), 2);

        // a reconnect of an existing member is not an admission
        let extra = Uuid::new_v4();
        let out = presence.join("r1", extra, Some("alice"), Some(2)).unwrap();
        assert_eq!(out.participants, 2);
    }

    #[test]
    fn test_teardown_iterates_all_rooms() {
        let presence = PresenceTracker::new();
        let session = Uuid::new_v4();
        let other = Uuid::new_v4();

        presence.join("r1", session, Some("alice"), None).unwrap();
        presence.join("r2", session, Some("alice"), None).unwrap();
        presence.join("r2", other, Some("bob"), None).unwrap();

        let mut emptied = Vec::new();
        let mut outcomes = presence.leave_all(session, |room| emptied.push(room.to_string()));
        outcomes.sort_by(|x, y| x.room_id.cmp(&y.room_id));
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].room_empty); // r1
        assert!(!outcomes[1].room_empty); // r2 still has bob
        assert_eq!(presence.participants("r2"), 1);
        // cleanup callback fires only for rooms that actually emptied
        assert_eq!(emptied, vec!["r1".to_string()]);

        // unknown session is a clean no-op
        assert!(presence.leave_all(session, |_| {}).is_empty());
    }
}
