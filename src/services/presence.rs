//! Presence tracker — ephemeral typing/cursor/selection overlays with a TTL.
//!
//! DESIGN
//! ======
//! Presence lives inside `RoomState`, keyed by display name, so there is at
//! most one entry per (room, user). Every activity message from a user
//! refreshes `expires_at = now + PRESENCE_TTL`. Expired entries are treated
//! as absent on read (`summarize_at` filters them) and are evicted by the
//! periodic sweep, which also publishes `ACTIVITY_ENDED` so clients can clear
//! stale cursor overlays.
//!
//! Summaries list users by join order, then name, so repeated calls over the
//! same set render identically.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::{Data, Frame, MessageType};
use crate::state::{AppState, RoomState};
use crate::topic::{ConnId, Topic};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
}

impl crate::frame::ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor_line: u32,
    pub anchor_col: u32,
    pub head_line: u32,
    pub head_col: u32,
}

/// Fields carried by an activity message. `None` leaves the stored value as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub typing: Option<bool>,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
}

impl Activity {
    /// Read `typing`, `cursor`, and `selection` from a frame payload.
    /// Malformed sub-objects are ignored.
    #[must_use]
    pub fn from_data(data: &Data) -> Self {
        Self {
            typing: data.get("typing").and_then(serde_json::Value::as_bool),
            cursor: data
                .get("cursor")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            selection: data
                .get("selection")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        }
    }

    #[must_use]
    pub fn typing(typing: bool) -> Self {
        Self { typing: Some(typing), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Connection that last reported activity for this user.
    pub conn_id: ConnId,
    pub user: String,
    pub typing: bool,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    pub expires_at: Instant,
    /// Join sequence of the user's earliest connection; display order key.
    pub joined_seq: u64,
}

impl PresenceEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUser {
    pub user: String,
    pub typing: bool,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSummary {
    pub room_id: String,
    pub active: Vec<ActiveUser>,
    pub active_count: usize,
    pub member_count: usize,
}

// =============================================================================
// ROOM-LOCAL OPERATIONS
// =============================================================================

/// Update or create the presence entry for `user` and push its expiry out.
/// Caller holds the room lock.
pub fn record_activity_at(
    room: &mut RoomState,
    conn_id: ConnId,
    user: &str,
    activity: Activity,
    ttl: Duration,
    now: Instant,
) -> PresenceEntry {
    let seq = room.first_seq_of(user).unwrap_or(u64::MAX);
    let entry = room
        .presence
        .entry(user.to_owned())
        .or_insert_with(|| PresenceEntry {
            conn_id,
            user: user.to_owned(),
            typing: false,
            cursor: None,
            selection: None,
            expires_at: now,
            joined_seq: seq,
        });

    // An expired entry is absent; do not resurrect its stale overlay.
    if entry.is_expired_at(now) {
        entry.typing = false;
        entry.cursor = None;
        entry.selection = None;
    }
    entry.conn_id = conn_id;
    entry.joined_seq = entry.joined_seq.min(seq);
    if let Some(typing) = activity.typing {
        entry.typing = typing;
    }
    if let Some(cursor) = activity.cursor {
        entry.cursor = Some(cursor);
    }
    if let Some(selection) = activity.selection {
        entry.selection = Some(selection);
    }
    entry.expires_at = now + ttl;
    entry.clone()
}

/// Active (non-expired) users in deterministic display order.
#[must_use]
pub fn summarize_at(room: &RoomState, now: Instant) -> PresenceSummary {
    let mut entries: Vec<&PresenceEntry> = room
        .presence
        .values()
        .filter(|entry| !entry.is_expired_at(now))
        .collect();
    entries.sort_by(|a, b| a.joined_seq.cmp(&b.joined_seq).then_with(|| a.user.cmp(&b.user)));

    let active: Vec<ActiveUser> = entries
        .into_iter()
        .map(|entry| ActiveUser {
            user: entry.user.clone(),
            typing: entry.typing,
            cursor: entry.cursor,
            selection: entry.selection,
        })
        .collect();

    PresenceSummary {
        room_id: room.id.clone(),
        active_count: active.len(),
        active,
        member_count: room.member_count(),
    }
}

/// Remove and return expired entries, sorted by user for stable fan-out.
pub fn take_expired_at(room: &mut RoomState, now: Instant) -> Vec<PresenceEntry> {
    let mut expired: Vec<String> = room
        .presence
        .iter()
        .filter(|(_, entry)| entry.is_expired_at(now))
        .map(|(user, _)| user.clone())
        .collect();
    expired.sort();
    expired
        .into_iter()
        .filter_map(|user| room.presence.remove(&user))
        .collect()
}

// =============================================================================
// STATE OPERATIONS
// =============================================================================

/// Presence summary of a live room.
///
/// # Errors
///
/// Returns [`PresenceError::RoomNotFound`] when the room has no live state.
pub async fn summarize(state: &AppState, room_id: &str) -> Result<PresenceSummary, PresenceError> {
    summarize_room_at(state, room_id, Instant::now()).await
}

/// Deterministic-time variant of [`summarize`].
///
/// # Errors
///
/// Returns [`PresenceError::RoomNotFound`] when the room has no live state.
pub async fn summarize_room_at(
    state: &AppState,
    room_id: &str,
    now: Instant,
) -> Result<PresenceSummary, PresenceError> {
    let Some(shared) = state.rooms.get(room_id).await else {
        return Err(PresenceError::RoomNotFound(room_id.to_owned()));
    };
    let room = shared.lock().await;
    if room.evicted {
        return Err(PresenceError::RoomNotFound(room_id.to_owned()));
    }
    Ok(summarize_at(&room, now))
}

/// Evict expired entries in every live room and publish `ACTIVITY_ENDED`
/// for each on the room's presence topic. Returns the number evicted.
pub async fn sweep_expired_at(state: &AppState, now: Instant) -> usize {
    let mut evicted = 0;
    for (room_id, shared) in state.rooms.snapshot().await {
        let mut room = shared.lock().await;
        let expired = take_expired_at(&mut room, now);
        if expired.is_empty() {
            continue;
        }
        let topic = Topic::presence(&room_id);
        for entry in expired {
            debug!(%room_id, user = %entry.user, "presence: entry expired");
            let frame = Frame::request(MessageType::ActivityEnded, Data::new())
                .with_room_id(&room_id)
                .with_from(&entry.user)
                .with_data("user", entry.user.clone())
                .with_data("conn_id", entry.conn_id.to_string());
            state.router.publish(&topic, frame).await;
            evicted += 1;
        }
    }
    evicted
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
