use super::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::services::buffer;
use crate::services::connection::{self, TeardownReason};
use crate::services::directory::{
    CreateRoom, CreatedRoom, DirectoryError, InMemoryDirectory, JoinedRoom, RoomDirectory, RoomInfo,
};
use crate::state::test_helpers::{self, MockBackend, TEST_CREDENTIAL, connect, seed_room};

/// Directory whose `store_code` can be switched to fail.
struct FlakyDirectory {
    inner: InMemoryDirectory,
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl RoomDirectory for FlakyDirectory {
    async fn create(&self, request: CreateRoom) -> Result<CreatedRoom, DirectoryError> {
        self.inner.create(request).await
    }

    async fn join(&self, room_id: &str, credential: &str, user: &str) -> Result<JoinedRoom, DirectoryError> {
        self.inner.join(room_id, credential, user).await
    }

    async fn leave(&self, room_id: &str, user: &str) -> Result<(), DirectoryError> {
        self.inner.leave(room_id, user).await
    }

    async fn resolve(&self, room_id: &str) -> Result<RoomInfo, DirectoryError> {
        self.inner.resolve(room_id).await
    }

    async fn authorize(&self, room_id: &str, credential: &str) -> Result<(), DirectoryError> {
        self.inner.authorize(room_id, credential).await
    }

    async fn store_code(&self, room_id: &str, code: &str, language: &str) -> Result<(), DirectoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DirectoryError::Invalid("store unavailable".into()));
        }
        self.inner.store_code(room_id, code, language).await
    }
}

fn flaky_state() -> (AppState, Arc<FlakyDirectory>) {
    let directory =
        Arc::new(FlakyDirectory { inner: InMemoryDirectory::new("javascript"), failing: AtomicBool::new(true) });
    let state = AppState::new(test_helpers::test_config(), directory.clone(), Arc::new(MockBackend::new()));
    (state, directory)
}

#[tokio::test]
async fn flush_stores_dirty_buffers_once() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    buffer::apply_update(&state, alice.conn_id, "saved".into(), Some("python".into())).await.unwrap();

    assert_eq!(flush_dirty(&state).await, FlushReport { flushed: 1, failed: 0 });
    assert_eq!(flush_dirty(&state).await, FlushReport::default());

    let joined = state.directory.join(&room_id, TEST_CREDENTIAL, "bob").await.unwrap();
    assert_eq!(joined.current_code, "saved");
    assert_eq!(joined.current_language, "python");
}

#[tokio::test]
async fn failed_flush_keeps_room_dirty_and_resident() {
    let (state, directory) = flaky_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    buffer::apply_update(&state, alice.conn_id, "unsaved".into(), None).await.unwrap();
    let now = Instant::now();
    connection::teardown_at(&state, alice.conn_id, TeardownReason::Left, now).await;

    assert_eq!(flush_dirty(&state).await, FlushReport { flushed: 0, failed: 1 });
    let grace = state.config.room_grace;
    assert_eq!(evict_idle_rooms_at(&state, now + grace).await, 0);
    assert!(state.rooms.get(&room_id).await.unwrap().lock().await.dirty);

    directory.failing.store(false, Ordering::SeqCst);
    assert_eq!(flush_dirty(&state).await.flushed, 1);
    assert_eq!(evict_idle_rooms_at(&state, now + grace).await, 1);
}

#[tokio::test]
async fn evicted_room_rehydrates_latest_code_on_next_join() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    buffer::apply_update(&state, alice.conn_id, "persisted".into(), None).await.unwrap();
    let now = Instant::now();
    connection::teardown_at(&state, alice.conn_id, TeardownReason::Left, now).await;
    flush_dirty(&state).await;

    let grace = state.config.room_grace;
    assert_eq!(evict_idle_rooms_at(&state, now + grace - Duration::from_millis(1)).await, 0);
    assert_eq!(evict_idle_rooms_at(&state, now + grace).await, 1);
    assert!(state.rooms.get(&room_id).await.is_none());

    let bob = connect(&state, &room_id, "bob").await;
    assert_eq!(bob.welcome.code, "persisted");
    assert_eq!(bob.welcome.version, 0);
}

#[tokio::test]
async fn occupied_room_is_never_evicted() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let _alice = connect(&state, &room_id, "alice").await;

    let far_future = Instant::now() + state.config.room_grace * 10;
    assert_eq!(evict_idle_rooms_at(&state, far_future).await, 0);
}

#[tokio::test]
async fn sweep_reaps_silent_connections_and_expires_presence() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let t0 = Instant::now();
    connection::handshake_at(&state, &room_id, TEST_CREDENTIAL, "alice", t0).await.unwrap();
    let bob = connection::handshake_at(&state, &room_id, TEST_CREDENTIAL, "bob", t0).await.unwrap();
    connection::heartbeat_at(&state, bob.conn_id, t0 + state.config.heartbeat_timeout / 2).await.unwrap();

    let report = sweep_once_at(&state, t0 + state.config.heartbeat_timeout).await;

    assert_eq!(report.reaped_connections, 1);
    // Both join-time entries outlived the presence TTL before alice was reaped.
    assert_eq!(report.expired_presence, 2);
    assert_eq!(report.evicted_rooms, 0);
    assert_eq!(state.connections.len().await, 1);
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn maintenance_futures_are_send() {
    let state = test_helpers::test_app_state();
    assert_send(&sweep_once_at(&state, Instant::now()));
    assert_send(&flush_dirty(&state));
}

#[tokio::test]
async fn shutdown_stops_tasks_and_flushes_pending_edits() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    buffer::apply_update(&state, alice.conn_id, "draft".into(), None).await.unwrap();

    let tasks = spawn_maintenance_tasks(&state);
    let report = tasks.shutdown(&state).await;

    assert_eq!(report.failed, 0);
    assert!(!state.rooms.get(&room_id).await.unwrap().lock().await.dirty);
    let joined = state.directory.join(&room_id, TEST_CREDENTIAL, "bob").await.unwrap();
    assert_eq!(joined.current_code, "draft");
}
