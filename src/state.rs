//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the configuration, the two collaborators (room directory and
//! execution backend), the topic router, and two owned tables:
//!
//! - `RoomRegistry`: live per-room state, each room behind its own mutex.
//! - `ConnectionTable`: every live connection, keyed by connection id.
//!
//! Both tables are reached only through their methods; nothing outside this
//! module touches the raw maps.
//!
//! LOCK ORDER
//! ==========
//! registry -> room -> router topic. The connection table lock is never
//! held while waiting on a room lock. Anything that must be observed in
//! accept order (buffer updates, JOIN/LEAVE, expiry) is published while the
//! room lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::exec::ExecutionBackend;
use crate::router::TopicRouter;
use crate::services::buffer::EditWindow;
use crate::services::directory::{JoinedRoom, RoomDirectory};
use crate::services::execution::SessionSlot;
use crate::services::presence::PresenceEntry;
use crate::topic::{ConnId, Topic};

// =============================================================================
// ROOM STATE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user: String,
    /// Monotonic join order within the room.
    pub joined_seq: u64,
}

/// Per-room live state. Kept in memory while the room has members and
/// flushed to the directory by the maintenance task.
#[derive(Debug)]
pub struct RoomState {
    pub id: String,
    pub name: String,
    pub code: String,
    pub language: String,
    /// Bumped on every accepted `UPDATE`.
    pub version: u64,
    /// Buffer changed since the last successful flush.
    pub dirty: bool,
    pub members: HashMap<ConnId, Member>,
    next_seq: u64,
    pub presence: HashMap<String, PresenceEntry>,
    pub edit_window: EditWindow,
    /// When the last member left; cleared on join.
    pub emptied_at: Option<Instant>,
    /// Set under the registry write lock when the room is dropped. Holders
    /// of a stale `SharedRoom` must treat it as not found.
    pub evicted: bool,
}

impl RoomState {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        code: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            code: code.into(),
            language: language.into(),
            version: 0,
            dirty: false,
            members: HashMap::new(),
            next_seq: 0,
            presence: HashMap::new(),
            edit_window: EditWindow::Idle,
            emptied_at: None,
            evicted: false,
        }
    }

    /// Build live state from a directory join response.
    #[must_use]
    pub fn hydrate(joined: &JoinedRoom) -> Self {
        Self::new(&joined.room_id, &joined.name, &joined.current_code, &joined.current_language)
    }

    /// Register a connection. Returns its join sequence number.
    pub fn add_member(&mut self, conn_id: ConnId, user: &str) -> u64 {
        let joined_seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(conn_id, Member { user: user.to_owned(), joined_seq });
        self.emptied_at = None;
        joined_seq
    }

    /// Drop a connection; stamps `emptied_at` when it was the last one.
    pub fn remove_member(&mut self, conn_id: ConnId, now: Instant) -> Option<Member> {
        let member = self.members.remove(&conn_id)?;
        if self.members.is_empty() {
            self.emptied_at = Some(now);
        }
        Some(member)
    }

    #[must_use]
    pub fn has_user(&self, user: &str) -> bool {
        self.members.values().any(|m| m.user == user)
    }

    /// Join sequence of the user's earliest live connection.
    #[must_use]
    pub fn first_seq_of(&self, user: &str) -> Option<u64> {
        self.members
            .values()
            .filter(|m| m.user == user)
            .map(|m| m.joined_seq)
            .min()
    }

    /// Distinct users connected right now.
    #[must_use]
    pub fn member_count(&self) -> usize {
        let mut users: Vec<&str> = self.members.values().map(|m| m.user.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        users.len()
    }

    /// Empty, clean, and past its grace period.
    #[must_use]
    pub fn is_evictable_at(&self, now: Instant, grace: Duration) -> bool {
        self.members.is_empty()
            && !self.dirty
            && self
                .emptied_at
                .is_some_and(|at| now.saturating_duration_since(at) >= grace)
    }
}

pub type SharedRoom = Arc<Mutex<RoomState>>;

// =============================================================================
// ROOM REGISTRY
// =============================================================================

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, SharedRoom>>>,
}

impl RoomRegistry {
    pub async fn get(&self, room_id: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Live state for the joined room, hydrating it from the join response
    /// if no live state exists. Existing live state wins over the directory
    /// copy, which may lag by one flush interval.
    pub async fn get_or_hydrate(&self, joined: &JoinedRoom) -> SharedRoom {
        if let Some(room) = self.get(&joined.room_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(joined.room_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RoomState::hydrate(joined))))
            .clone()
    }

    pub async fn snapshot(&self) -> Vec<(String, SharedRoom)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect()
    }

    /// Remove `room_id` if `evictable` holds for its current state. The check
    /// and the removal happen under the registry write lock, so a concurrent
    /// join either lands before (and blocks eviction) or after (and hydrates
    /// fresh state).
    pub async fn evict_if(&self, room_id: &str, evictable: impl FnOnce(&RoomState) -> bool) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(shared) = rooms.get(room_id).cloned() else {
            return false;
        };
        let mut room = shared.lock().await;
        if !evictable(&room) {
            return false;
        }
        room.evicted = true;
        rooms.remove(room_id);
        true
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

// =============================================================================
// CONNECTION TABLE
// =============================================================================

/// A live connection. Identity (`user`, `room_id`) is fixed for its lifetime.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnId,
    pub user: String,
    pub room_id: String,
    pub subscriptions: Vec<Topic>,
    pub last_heartbeat: Instant,
    /// At most one execution session per connection.
    pub session: SessionSlot,
}

#[derive(Clone, Default)]
pub struct ConnectionTable {
    connections: Arc<RwLock<HashMap<ConnId, Connection>>>,
}

impl ConnectionTable {
    pub async fn insert(&self, connection: Connection) {
        self.connections.write().await.insert(connection.id, connection);
    }

    pub async fn get(&self, conn_id: ConnId) -> Option<Connection> {
        self.connections.read().await.get(&conn_id).cloned()
    }

    /// Remove and return the connection. `None` means another path already
    /// tore it down.
    pub async fn remove(&self, conn_id: ConnId) -> Option<Connection> {
        self.connections.write().await.remove(&conn_id)
    }

    /// Record a heartbeat. Returns false for unknown connections.
    pub async fn touch_at(&self, conn_id: ConnId, now: Instant) -> bool {
        let mut connections = self.connections.write().await;
        let Some(connection) = connections.get_mut(&conn_id) else {
            return false;
        };
        connection.last_heartbeat = now;
        true
    }

    /// Connections silent for at least `timeout`.
    pub async fn stale_at(&self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| now.saturating_duration_since(c.last_heartbeat) >= timeout)
            .map(|c| c.id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn RoomDirectory>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub rooms: RoomRegistry,
    pub connections: ConnectionTable,
    pub router: TopicRouter,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, directory: Arc<dyn RoomDirectory>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            config: Arc::new(config),
            directory,
            backend,
            rooms: RoomRegistry::default(),
            connections: ConnectionTable::default(),
            router: TopicRouter::new(),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
