//! Collaborative buffer coordinator — last-writer-wins shared code buffer.
//!
//! DESIGN
//! ======
//! Each room holds one authoritative `{code, language}` pair. `UPDATE`
//! overwrites it unconditionally under the room lock, bumps `version`,
//! marks the room dirty for the flush task, and rebroadcasts to every other
//! member on `room/{id}/code`. The sender never gets its own update back.
//!
//! `TYPING` / `STOPPED_TYPING` move the room's advisory edit window
//! (`Idle -> Editing -> Idle`). The window is informational: it is fanned out
//! so clients can debounce, but the server never refuses an `UPDATE` because
//! someone else holds it.
//!
//! TRADE-OFFS
//! ==========
//! Two users editing inside the same debounce window race; the later
//! `UPDATE` silently replaces the earlier one. There is no merge and no
//! version check on write. `version` only lets clients notice that they
//! missed something.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::frame::{Data, Frame, MessageType};
use crate::services::presence::{self, Activity};
use crate::state::{AppState, Connection, RoomState, SharedRoom};
use crate::topic::{ConnId, Topic};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnId),
    #[error("room not found: {0}")]
    RoomNotFound(String),
}

impl crate::frame::ErrorCode for BufferError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "E_CONNECTION_NOT_FOUND",
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
        }
    }
}

/// Advisory per-room edit state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EditWindow {
    #[default]
    Idle,
    Editing { user: String, until: Instant },
}

impl EditWindow {
    /// User currently inside an open window, if any.
    #[must_use]
    pub fn holder_at(&self, now: Instant) -> Option<&str> {
        match self {
            Self::Editing { user, until } if *until > now => Some(user),
            _ => None,
        }
    }

    /// Open (or extend) the window for `user`.
    pub fn open(&mut self, user: &str, now: Instant, window: Duration) {
        *self = Self::Editing { user: user.to_owned(), until: now + window };
    }

    /// Close the window if `user` holds it.
    pub fn close(&mut self, user: &str) {
        if matches!(self, Self::Editing { user: holder, .. } if holder == user) {
            *self = Self::Idle;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferSnapshot {
    pub code: String,
    pub language: String,
    pub version: u64,
    /// Holder of the advisory edit window.
    pub editing: Option<String>,
}

impl BufferSnapshot {
    #[must_use]
    pub fn of(room: &RoomState, now: Instant) -> Self {
        Self {
            code: room.code.clone(),
            language: room.language.clone(),
            version: room.version,
            editing: room.edit_window.holder_at(now).map(str::to_owned),
        }
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Accept an `UPDATE` from `conn_id`: overwrite the buffer and rebroadcast
/// to the rest of the room. Returns the new version.
///
/// # Errors
///
/// Returns `ConnectionNotFound` / `RoomNotFound` when either no longer exists.
pub async fn apply_update(
    state: &AppState,
    conn_id: ConnId,
    code: String,
    language: Option<String>,
) -> Result<u64, BufferError> {
    let (conn, shared) = resolve(state, conn_id).await?;
    let mut room = lock_live(&shared, &conn.room_id).await?;

    room.code = code;
    if let Some(language) = language.filter(|l| !l.trim().is_empty()) {
        room.language = language.trim().to_owned();
    }
    room.version += 1;
    room.dirty = true;
    room.edit_window.close(&conn.user);

    let frame = Frame::request(MessageType::Update, Data::new())
        .with_room_id(&room.id)
        .with_from(&conn.user)
        .with_data("code", room.code.clone())
        .with_data("language", room.language.clone())
        .with_data("version", room.version);
    let delivery = state
        .router
        .publish_except(&Topic::code(&room.id), frame, Some(conn_id))
        .await;
    debug!(
        %conn_id,
        room_id = %room.id,
        version = room.version,
        delivered = delivery.delivered,
        "buffer: update applied"
    );
    Ok(room.version)
}

/// Fan out `TYPING` (`typing = true`) or `STOPPED_TYPING` to the rest of the
/// room and move the advisory edit window accordingly.
///
/// # Errors
///
/// Returns `ConnectionNotFound` / `RoomNotFound` when either no longer exists.
pub async fn signal_typing(state: &AppState, conn_id: ConnId, typing: bool) -> Result<(), BufferError> {
    signal_typing_at(state, conn_id, typing, Instant::now()).await
}

/// Deterministic-time variant of [`signal_typing`].
///
/// # Errors
///
/// See [`signal_typing`].
pub async fn signal_typing_at(
    state: &AppState,
    conn_id: ConnId,
    typing: bool,
    now: Instant,
) -> Result<(), BufferError> {
    let (conn, shared) = resolve(state, conn_id).await?;
    let mut room = lock_live(&shared, &conn.room_id).await?;

    if typing {
        room.edit_window.open(&conn.user, now, state.config.edit_window);
    } else {
        room.edit_window.close(&conn.user);
    }
    presence::record_activity_at(
        &mut room,
        conn_id,
        &conn.user,
        Activity::typing(typing),
        state.config.presence_ttl,
        now,
    );

    let kind = if typing { MessageType::Typing } else { MessageType::StoppedTyping };
    let frame = Frame::request(kind, Data::new())
        .with_room_id(&room.id)
        .with_from(&conn.user)
        .with_data("user", conn.user.clone());
    state
        .router
        .publish_except(&Topic::code(&room.id), frame, Some(conn_id))
        .await;
    Ok(())
}

/// Record cursor/selection activity and rebroadcast it on the presence
/// topic. Never touches the buffer.
///
/// # Errors
///
/// Returns `ConnectionNotFound` / `RoomNotFound` when either no longer exists.
pub async fn cursor_activity(state: &AppState, conn_id: ConnId, activity: Activity) -> Result<(), BufferError> {
    cursor_activity_at(state, conn_id, activity, Instant::now()).await
}

/// Deterministic-time variant of [`cursor_activity`].
///
/// # Errors
///
/// See [`cursor_activity`].
pub async fn cursor_activity_at(
    state: &AppState,
    conn_id: ConnId,
    activity: Activity,
    now: Instant,
) -> Result<(), BufferError> {
    let (conn, shared) = resolve(state, conn_id).await?;
    let mut room = lock_live(&shared, &conn.room_id).await?;

    let entry = presence::record_activity_at(&mut room, conn_id, &conn.user, activity, state.config.presence_ttl, now);

    let frame = Frame::request(MessageType::CursorActivity, Data::new())
        .with_room_id(&room.id)
        .with_from(&conn.user)
        .with_data("user", conn.user.clone())
        .with_data("typing", entry.typing)
        .with_data("cursor", serde_json::to_value(entry.cursor).unwrap_or_default())
        .with_data("selection", serde_json::to_value(entry.selection).unwrap_or_default());
    state
        .router
        .publish_except(&Topic::presence(&room.id), frame, Some(conn_id))
        .await;
    Ok(())
}

/// Current buffer of a live room.
///
/// # Errors
///
/// Returns [`BufferError::RoomNotFound`] when the room has no live state.
pub async fn snapshot(state: &AppState, room_id: &str) -> Result<BufferSnapshot, BufferError> {
    let Some(shared) = state.rooms.get(room_id).await else {
        return Err(BufferError::RoomNotFound(room_id.to_owned()));
    };
    let room = lock_live(&shared, room_id).await?;
    Ok(BufferSnapshot::of(&room, Instant::now()))
}

// =============================================================================
// HELPERS
// =============================================================================

async fn resolve(state: &AppState, conn_id: ConnId) -> Result<(Connection, SharedRoom), BufferError> {
    let Some(conn) = state.connections.get(conn_id).await else {
        return Err(BufferError::ConnectionNotFound(conn_id));
    };
    let Some(shared) = state.rooms.get(&conn.room_id).await else {
        return Err(BufferError::RoomNotFound(conn.room_id));
    };
    Ok((conn, shared))
}

async fn lock_live<'a>(
    shared: &'a SharedRoom,
    room_id: &str,
) -> Result<tokio::sync::MutexGuard<'a, RoomState>, BufferError> {
    let room = shared.lock().await;
    if room.evicted {
        return Err(BufferError::RoomNotFound(room_id.to_owned()));
    }
    Ok(room)
}

#[cfg(test)]
#[path = "buffer_test.rs"]
mod tests;
