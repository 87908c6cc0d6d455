use super::*;
use crate::state::test_helpers::{self, TEST_CREDENTIAL, connect, seed_room};

#[test]
fn directory_error_to_status_maps_each_variant() {
    assert_eq!(
        directory_error_to_status(DirectoryError::RoomNotFound("ABC123".into())),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        directory_error_to_status(DirectoryError::Unauthorized("ABC123".into())),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        directory_error_to_status(DirectoryError::Invalid("name required".into())),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn create_room_returns_created_with_plaintext_credential_once() {
    let state = test_helpers::test_app_state();
    let body = CreateRoomBody { name: " Pairing ".into(), password: "hunter2".into(), username: "alice".into() };

    let (status, Json(created)) = create_room(State(state.clone()), Json(body)).await.unwrap();

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created.name, "Pairing");
    assert_eq!(created.credential, "hunter2");
    assert_eq!(created.member_count, 1);

    let Json(info) = get_room(State(state), Path(created.room_id.to_lowercase())).await.unwrap();
    assert_eq!(info.room_id, created.room_id);
    assert_eq!(info.creator, "alice");
}

#[tokio::test]
async fn create_room_rejects_short_password() {
    let state = test_helpers::test_app_state();
    let body = CreateRoomBody { name: "Room".into(), password: "abc".into(), username: "alice".into() };

    let err = create_room(State(state), Json(body)).await.unwrap_err();
    assert_eq!(err, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn presence_requires_credential_and_reports_live_users() {
    let state = test_helpers::test_app_state();
    let room_id = seed_room(&state, "alice").await;

    let denied = get_presence(
        State(state.clone()),
        Path(room_id.clone()),
        Query(PresenceQuery { password: "wrong".into() }),
    )
    .await;
    assert_eq!(denied.unwrap_err(), StatusCode::UNAUTHORIZED);

    let Json(empty) = get_presence(
        State(state.clone()),
        Path(room_id.clone()),
        Query(PresenceQuery { password: TEST_CREDENTIAL.into() }),
    )
    .await
    .unwrap();
    assert_eq!(empty.active_count, 0);

    let _alice = connect(&state, &room_id, "alice").await;
    let Json(summary) = get_presence(
        State(state),
        Path(room_id),
        Query(PresenceQuery { password: TEST_CREDENTIAL.into() }),
    )
    .await
    .unwrap();
    assert_eq!(summary.active_count, 1);
    assert_eq!(summary.active[0].user, "alice");
}

#[tokio::test]
async fn unknown_room_is_not_found() {
    let state = test_helpers::test_app_state();
    let err = get_room(State(state), Path("ZZZZZZ".into())).await.unwrap_err();
    assert_eq!(err, StatusCode::NOT_FOUND);
}
