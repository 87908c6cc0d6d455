//! Connection manager — handshake, heartbeat, and teardown.
//!
//! DESIGN
//! ======
//! A handshake asks the directory for a yes/no join, hydrates the room's
//! live state if needed, subscribes the new connection to the room's
//! `chat`, `code`, and `presence` topics plus its private
//! `execution-output` topic, and announces `JOIN` to the rest of the room.
//!
//! `teardown` is the single exit path for transport close, explicit
//! `LEAVE`, and heartbeat timeout. Removing the connection from the table is
//! the linearization point: whichever caller removes it does the cleanup,
//! every other caller gets `false`. That keeps `LEAVE` exactly-once no matter
//! how many paths race to close the same connection.
//!
//! ERROR HANDLING
//! ==============
//! Directory refusals (`RoomNotFound`, `Unauthorized`, `Invalid`) are
//! returned once and the handshake is abandoned. A failed directory `leave`
//! during teardown is logged; local cleanup still completes.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame, MessageType};
use crate::router::RouterError;
use crate::services::buffer::BufferSnapshot;
use crate::services::directory::DirectoryError;
use crate::services::execution;
use crate::services::presence::{self, Activity, PresenceSummary};
use crate::state::{AppState, Connection};
use crate::topic::{ConnId, RoomChannel, Topic};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnId),
}

impl ErrorCode for ConnectionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Directory(e) => e.error_code(),
            Self::Router(e) => e.error_code(),
            Self::ConnectionNotFound(_) => "E_CONNECTION_NOT_FOUND",
        }
    }
}

/// Why a connection went away. Carried in the `LEAVE` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Transport closed.
    Closed,
    /// Client sent `LEAVE`.
    Left,
    HeartbeatTimeout,
}

impl TeardownReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Left => "left",
            Self::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

/// Snapshot handed to a new connection (sent as `CONNECTED`).
#[derive(Debug, Clone, Serialize)]
pub struct Welcome {
    pub conn_id: ConnId,
    pub user: String,
    pub room_id: String,
    pub name: String,
    pub code: String,
    pub language: String,
    pub version: u64,
    /// Directory member count after this join.
    pub member_count: usize,
    pub presence: PresenceSummary,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Welcome {
    #[must_use]
    pub fn to_data(&self) -> Data {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Data::new(),
        }
    }
}

/// A registered connection and the receiving end of its outbound queue.
pub struct Connected {
    pub conn_id: ConnId,
    pub rx: mpsc::Receiver<Frame>,
    pub welcome: Welcome,
}

/// Topics every connection is subscribed to for its lifetime.
#[must_use]
pub fn subscription_topics(room_id: &str, conn_id: ConnId) -> Vec<Topic> {
    let mut topics: Vec<Topic> = RoomChannel::ALL
        .iter()
        .map(|channel| Topic::room(room_id, *channel))
        .collect();
    topics.push(Topic::execution_output(conn_id));
    topics
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Bind a new connection to `(room_id, user)`.
///
/// # Errors
///
/// Returns the directory's refusal (`RoomNotFound`, `Unauthorized`,
/// `Invalid`) without registering anything.
pub async fn handshake(
    state: &AppState,
    room_id: &str,
    credential: &str,
    user: &str,
) -> Result<Connected, ConnectionError> {
    handshake_at(state, room_id, credential, user, Instant::now()).await
}

/// Deterministic-time variant of [`handshake`].
///
/// # Errors
///
/// See [`handshake`].
pub async fn handshake_at(
    state: &AppState,
    room_id: &str,
    credential: &str,
    user: &str,
    now: Instant,
) -> Result<Connected, ConnectionError> {
    let joined = match state.directory.join(room_id, credential, user).await {
        Ok(joined) => joined,
        Err(e) => {
            info!(room_id, user, error = %e, "connection: handshake refused");
            return Err(e.into());
        }
    };
    let user = user.trim().to_owned();
    let conn_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(state.config.outbound_queue_capacity);
    let subscriptions = subscription_topics(&joined.room_id, conn_id);

    loop {
        let shared = state.rooms.get_or_hydrate(&joined).await;
        let mut room = shared.lock().await;
        if room.evicted {
            // Lost a race with eviction; hydrate fresh state.
            continue;
        }

        for topic in &subscriptions {
            if let Err(e) = state.router.subscribe(conn_id, topic, tx.clone()).await {
                state.router.unsubscribe_all(conn_id, &subscriptions).await;
                return Err(e.into());
            }
        }
        state
            .connections
            .insert(Connection {
                id: conn_id,
                user: user.clone(),
                room_id: room.id.clone(),
                subscriptions: subscriptions.clone(),
                last_heartbeat: now,
                session: execution::SessionSlot::default(),
            })
            .await;
        room.add_member(conn_id, &user);
        presence::record_activity_at(&mut room, conn_id, &user, Activity::default(), state.config.presence_ttl, now);

        let join = Frame::request(MessageType::Join, Data::new())
            .with_room_id(&room.id)
            .with_from(&user)
            .with_data("conn_id", conn_id.to_string())
            .with_data("user", user.clone())
            .with_data("member_count", joined.member_count);
        state
            .router
            .publish_except(&Topic::presence(&room.id), join, Some(conn_id))
            .await;

        let buffer = BufferSnapshot::of(&room, now);
        let welcome = Welcome {
            conn_id,
            user: user.clone(),
            room_id: room.id.clone(),
            name: room.name.clone(),
            code: buffer.code,
            language: buffer.language,
            version: buffer.version,
            member_count: joined.member_count,
            presence: presence::summarize_at(&room, now),
            heartbeat_interval_ms: millis(state.config.heartbeat_interval),
            heartbeat_timeout_ms: millis(state.config.heartbeat_timeout),
        };
        info!(%conn_id, room_id = %room.id, user = %user, "connection: handshake accepted");
        return Ok(Connected { conn_id, rx, welcome });
    }
}

// =============================================================================
// HEARTBEAT
// =============================================================================

/// Record a heartbeat for `conn_id`.
///
/// # Errors
///
/// Returns [`ConnectionError::ConnectionNotFound`] for unknown connections.
pub async fn heartbeat(state: &AppState, conn_id: ConnId) -> Result<(), ConnectionError> {
    heartbeat_at(state, conn_id, Instant::now()).await
}

/// Deterministic-time variant of [`heartbeat`].
///
/// # Errors
///
/// See [`heartbeat`].
pub async fn heartbeat_at(state: &AppState, conn_id: ConnId, now: Instant) -> Result<(), ConnectionError> {
    if state.connections.touch_at(conn_id, now).await {
        Ok(())
    } else {
        Err(ConnectionError::ConnectionNotFound(conn_id))
    }
}

/// Tear down every connection silent for at least the heartbeat timeout.
/// Returns the ids actually torn down by this call.
pub async fn reap_stale_at(state: &AppState, now: Instant) -> Vec<ConnId> {
    let stale = state
        .connections
        .stale_at(now, state.config.heartbeat_timeout)
        .await;
    let mut reaped = Vec::with_capacity(stale.len());
    for conn_id in stale {
        if teardown_at(state, conn_id, TeardownReason::HeartbeatTimeout, now).await {
            reaped.push(conn_id);
        }
    }
    reaped
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// Remove `conn_id` and everything hanging off it. Returns `false` if the
/// connection was already gone.
pub async fn teardown(state: &AppState, conn_id: ConnId, reason: TeardownReason) -> bool {
    teardown_at(state, conn_id, reason, Instant::now()).await
}

/// Deterministic-time variant of [`teardown`].
pub async fn teardown_at(state: &AppState, conn_id: ConnId, reason: TeardownReason, now: Instant) -> bool {
    let Some(conn) = state.connections.remove(conn_id).await else {
        return false;
    };

    state.router.unsubscribe_all(conn_id, &conn.subscriptions).await;
    execution::discard(&conn).await;

    let mut last_of_user = true;
    if let Some(shared) = state.rooms.get(&conn.room_id).await {
        let mut room = shared.lock().await;
        if !room.evicted {
            room.remove_member(conn_id, now);
            last_of_user = !room.has_user(&conn.user);
            if last_of_user {
                room.presence.remove(&conn.user);
            }

            let leave = Frame::request(MessageType::Leave, Data::new())
                .with_room_id(&room.id)
                .with_from(&conn.user)
                .with_data("conn_id", conn_id.to_string())
                .with_data("user", conn.user.clone())
                .with_data("reason", reason.as_str())
                .with_data("member_count", room.member_count());
            state.router.publish(&Topic::presence(&room.id), leave).await;
        }
    }

    if last_of_user {
        if let Err(e) = state.directory.leave(&conn.room_id, &conn.user).await {
            warn!(%conn_id, room_id = %conn.room_id, error = %e, "connection: directory leave failed");
        }
    }
    info!(%conn_id, room_id = %conn.room_id, user = %conn.user, reason = reason.as_str(), "connection: torn down");
    true
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
