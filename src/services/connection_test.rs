use super::*;
use std::sync::Arc;
use std::time::Duration;

use crate::exec::ExecRequest;
use crate::services::directory::DirectoryError;
use crate::services::{buffer, execution};
use crate::state::test_helpers::{
    self, MockBackend, Script, TEST_CREDENTIAL, assert_no_frame, connect, drain, recv_frame, seed_room, stdout,
};

fn leaves(frames: &[Frame]) -> Vec<&Frame> {
    frames.iter().filter(|f| f.kind == MessageType::Leave).collect()
}

#[tokio::test]
async fn handshake_refusals_register_nothing() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;

    let missing = handshake(&state, "NOROOM", TEST_CREDENTIAL, "bob").await;
    assert!(matches!(
        missing,
        Err(ConnectionError::Directory(DirectoryError::RoomNotFound(_)))
    ));
    let wrong = handshake(&state, &room_id, "nope", "bob").await;
    assert!(matches!(
        wrong,
        Err(ConnectionError::Directory(DirectoryError::Unauthorized(_)))
    ));
    let err = wrong.err().unwrap();
    assert_eq!(err.error_code(), "E_UNAUTHORIZED");

    assert!(state.connections.is_empty().await);
    assert!(state.rooms.is_empty().await);
}

#[tokio::test]
async fn handshake_subscribes_all_topics_and_announces_join_to_peers() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let mut alice = connect(&state, &room_id, "alice").await;

    let mut bob = connect(&state, &room_id, "bob").await;

    for topic in subscription_topics(&room_id, bob.conn_id) {
        let expected = if topic.owner().is_some() { 1 } else { 2 };
        assert_eq!(state.router.subscriber_count(&topic).await, expected, "{topic}");
    }
    let join = recv_frame(&mut alice.rx).await;
    assert_eq!(join.kind, MessageType::Join);
    assert_eq!(join.from.as_deref(), Some("bob"));
    assert_eq!(join.str_field("conn_id"), Some(bob.conn_id.to_string().as_str()));
    assert_no_frame(&mut bob.rx).await;

    assert_eq!(bob.welcome.member_count, 2);
    assert_eq!(bob.welcome.room_id, room_id);
    assert_eq!(bob.welcome.presence.active_count, 2);
}

#[tokio::test]
async fn late_joiner_sees_latest_code() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    buffer::apply_update(&state, alice.conn_id, "int main() {}".into(), Some("cpp".into()))
        .await
        .unwrap();

    let bob = connect(&state, &room_id, &format!(" {} ", "bob")).await;

    assert_eq!(bob.welcome.member_count, 2);
    assert_eq!(bob.welcome.code, "int main() {}");
    assert_eq!(bob.welcome.language, "cpp");
    assert_eq!(bob.welcome.user, "bob");
}

#[tokio::test]
async fn silent_connection_is_reaped_with_exactly_one_leave() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let t0 = Instant::now();
    let mut alice = handshake_at(&state, &room_id, TEST_CREDENTIAL, "alice", t0).await.unwrap();
    let mut bob = handshake_at(&state, &room_id, TEST_CREDENTIAL, "bob", t0).await.unwrap();
    drain(&mut alice.rx);
    drain(&mut bob.rx);
    let timeout = state.config.heartbeat_timeout;

    heartbeat_at(&state, bob.conn_id, t0 + timeout / 2).await.unwrap();
    assert!(reap_stale_at(&state, t0 + timeout - Duration::from_millis(1)).await.is_empty());

    let reaped = reap_stale_at(&state, t0 + timeout).await;
    assert_eq!(reaped, vec![alice.conn_id]);
    assert!(reap_stale_at(&state, t0 + timeout).await.is_empty());
    assert!(!teardown(&state, alice.conn_id, TeardownReason::Closed).await);

    let frames = drain(&mut bob.rx);
    let leave = leaves(&frames);
    assert_eq!(leave.len(), 1);
    assert_eq!(leave[0].from.as_deref(), Some("alice"));
    assert_eq!(leave[0].str_field("reason"), Some("heartbeat_timeout"));

    let room = state.rooms.get(&room_id).await.unwrap();
    let room = room.lock().await;
    assert!(!room.presence.contains_key("alice"));
    assert!(!room.members.contains_key(&alice.conn_id));
    drop(room);

    // All senders are gone, so the transport loop sees the queue close.
    assert!(alice.rx.recv().await.is_none());
    assert_eq!(state.directory.resolve(&room_id).await.unwrap().member_count, 1);
}

#[tokio::test]
async fn concurrent_teardowns_publish_leave_once() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    let mut bob = connect(&state, &room_id, "bob").await;
    drain(&mut bob.rx);

    let (a, b) = tokio::join!(
        teardown(&state, alice.conn_id, TeardownReason::Closed),
        teardown(&state, alice.conn_id, TeardownReason::Left),
    );

    assert!(a ^ b);
    assert_eq!(leaves(&drain(&mut bob.rx)).len(), 1);
    for topic in subscription_topics(&room_id, alice.conn_id) {
        let expected = usize::from(topic.owner().is_none());
        assert_eq!(state.router.subscriber_count(&topic).await, expected);
    }
}

#[tokio::test]
async fn second_connection_of_same_user_keeps_presence_and_membership() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let first = connect(&state, &room_id, "alice").await;
    let _second = connect(&state, &room_id, "alice").await;

    assert!(teardown(&state, first.conn_id, TeardownReason::Closed).await);

    let room = state.rooms.get(&room_id).await.unwrap();
    assert!(room.lock().await.presence.contains_key("alice"));
    assert_eq!(state.directory.resolve(&room_id).await.unwrap().member_count, 1);
}

#[tokio::test]
async fn teardown_cancels_active_execution() {
    let backend = Arc::new(MockBackend::new().with_script("loop", Script::Hang(vec![stdout("tick\n")])));
    let state = test_helpers::test_app_state_with(test_helpers::test_config(), backend.clone());
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    execution::run_request(
        &state,
        alice.conn_id,
        ExecRequest { code: "loop".into(), language: "python".into(), stdin: None },
    )
    .await
    .unwrap();

    assert!(teardown(&state, alice.conn_id, TeardownReason::Left).await);

    tokio::time::timeout(Duration::from_millis(500), async {
        while backend.cancelled() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backend run should be cancelled");
}

#[tokio::test]
async fn last_member_leaving_stamps_room_empty() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;
    let alice = connect(&state, &room_id, "alice").await;
    let now = Instant::now();

    assert!(teardown_at(&state, alice.conn_id, TeardownReason::Left, now).await);

    let room = state.rooms.get(&room_id).await.unwrap();
    assert_eq!(room.lock().await.emptied_at, Some(now));
}

#[tokio::test]
async fn heartbeat_for_unknown_connection_is_not_found() {
    let state = test_helpers::test_app_state();
    let ghost = uuid::Uuid::new_v4();
    assert!(matches!(
        heartbeat(&state, ghost).await,
        Err(ConnectionError::ConnectionNotFound(id)) if id == ghost
    ));
}

#[tokio::test]
async fn room_traffic_never_reaches_another_room() {
    let state = test_helpers::test_app_state();
    let room_a = seed_room(&state, "alice").await;
    let room_b = seed_room(&state, "bob").await;
    let mut alice = connect(&state, &room_a, "alice").await;
    let mut bob = connect(&state, &room_b, "bob").await;
    drain(&mut bob.rx);

    let carol = connect(&state, &room_a, "carol").await;
    buffer::apply_update(&state, carol.conn_id, "room a only".into(), None).await.unwrap();
    buffer::cursor_activity(&state, carol.conn_id, Activity::typing(true)).await.unwrap();
    assert!(teardown(&state, carol.conn_id, TeardownReason::Left).await);

    let seen: Vec<MessageType> = drain(&mut alice.rx).iter().map(|f| f.kind).collect();
    assert_eq!(
        seen,
        [MessageType::Join, MessageType::Update, MessageType::CursorActivity, MessageType::Leave]
    );
    assert_no_frame(&mut bob.rx).await;
    assert_eq!(buffer::snapshot(&state, &room_b).await.unwrap().code, "");
}
