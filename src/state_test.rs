use super::*;
use uuid::Uuid;

fn room() -> RoomState {
    RoomState::new("ROOM01", "Interview", "", "javascript")
}

fn joined(code: &str) -> JoinedRoom {
    JoinedRoom {
        room_id: "ROOM01".into(),
        name: "Interview".into(),
        current_code: code.into(),
        current_language: "python".into(),
        member_count: 1,
    }
}

#[test]
fn add_member_assigns_increasing_join_sequence() {
    let mut room = room();
    let a = room.add_member(Uuid::new_v4(), "alice");
    let b = room.add_member(Uuid::new_v4(), "bob");
    assert!(a < b);
    assert_eq!(room.member_count(), 2);
}

#[test]
fn member_count_counts_distinct_users() {
    let mut room = room();
    room.add_member(Uuid::new_v4(), "alice");
    room.add_member(Uuid::new_v4(), "alice");
    assert_eq!(room.member_count(), 1);
    assert_eq!(room.members.len(), 2);
}

#[test]
fn removing_last_member_stamps_emptied_at() {
    let mut room = room();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    room.add_member(a, "alice");
    room.add_member(b, "bob");
    let now = Instant::now();

    room.remove_member(a, now);
    assert_eq!(room.emptied_at, None);
    room.remove_member(b, now);
    assert_eq!(room.emptied_at, Some(now));

    room.add_member(Uuid::new_v4(), "carol");
    assert_eq!(room.emptied_at, None);
}

#[test]
fn evictable_requires_empty_clean_and_grace_elapsed() {
    let grace = Duration::from_secs(60);
    let mut room = room();
    let conn = Uuid::new_v4();
    let start = Instant::now();
    room.add_member(conn, "alice");
    assert!(!room.is_evictable_at(start + grace * 2, grace));

    room.remove_member(conn, start);
    assert!(!room.is_evictable_at(start + grace / 2, grace));
    assert!(room.is_evictable_at(start + grace, grace));

    room.dirty = true;
    assert!(!room.is_evictable_at(start + grace, grace));
}

#[tokio::test]
async fn evict_if_marks_state_and_removes_entry() {
    let registry = RoomRegistry::default();
    let shared = registry.get_or_hydrate(&joined("")).await;

    assert!(!registry.evict_if("ROOM01", |_| false).await);
    assert!(registry.evict_if("ROOM01", |_| true).await);

    assert!(shared.lock().await.evicted);
    assert!(registry.get("ROOM01").await.is_none());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn get_or_hydrate_keeps_existing_live_state() {
    let registry = RoomRegistry::default();
    let joined = joined("stale");
    let first = registry.get_or_hydrate(&joined).await;
    first.lock().await.code = "live".into();

    let second = registry.get_or_hydrate(&joined).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.lock().await.code, "live");
}

#[tokio::test]
async fn connection_table_reports_stale_connections() {
    let state = test_helpers::test_app_state();
    let start = Instant::now();
    let conn = Connection {
        id: Uuid::new_v4(),
        user: "alice".into(),
        room_id: "ROOM01".into(),
        subscriptions: Vec::new(),
        last_heartbeat: start,
        session: SessionSlot::default(),
    };
    let id = conn.id;
    state.connections.insert(conn).await;
    let timeout = state.config.heartbeat_timeout;

    assert!(state.connections.stale_at(start + timeout / 2, timeout).await.is_empty());
    assert_eq!(state.connections.stale_at(start + timeout, timeout).await, vec![id]);

    assert!(state.connections.touch_at(id, start + timeout).await);
    assert!(state.connections.stale_at(start + timeout, timeout).await.is_empty());
    assert!(!state.connections.touch_at(Uuid::new_v4(), start).await);
}
