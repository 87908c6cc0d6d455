//! Room REST routes: create, look up, and inspect presence.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use tracing::info;

use crate::services::directory::{self, CreateRoom, CreatedRoom, DirectoryError, RoomInfo};
use crate::services::presence::{self, PresenceError, PresenceSummary};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateRoomBody {
    pub name: String,
    pub password: String,
    pub username: String,
}

#[derive(Deserialize)]
pub struct PresenceQuery {
    #[serde(default)]
    pub password: String,
}

/// `POST /api/rooms` — create a room. The creator becomes its first member.
pub async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<CreatedRoom>), StatusCode> {
    let created = state
        .directory
        .create(CreateRoom { name: body.name, credential: body.password, creator: body.username })
        .await
        .map_err(directory_error_to_status)?;
    info!(room_id = %created.room_id, creator = %created.creator, "rooms: created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /api/rooms/:id` — name, creator, and member count.
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>, StatusCode> {
    let info = state
        .directory
        .resolve(&room_id)
        .await
        .map_err(directory_error_to_status)?;
    Ok(Json(info))
}

/// `GET /api/rooms/:id/presence?password=` — active users in a room.
///
/// A room without live state (nobody connected) reports an empty summary.
pub async fn get_presence(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<PresenceQuery>,
) -> Result<Json<PresenceSummary>, StatusCode> {
    state
        .directory
        .authorize(&room_id, &query.password)
        .await
        .map_err(directory_error_to_status)?;

    let room_id = directory::normalize_room_id(&room_id);
    match presence::summarize(&state, &room_id).await {
        Ok(summary) => Ok(Json(summary)),
        Err(PresenceError::RoomNotFound(_)) => Ok(Json(PresenceSummary {
            room_id,
            active: Vec::new(),
            active_count: 0,
            member_count: 0,
        })),
    }
}

pub(crate) fn directory_error_to_status(err: DirectoryError) -> StatusCode {
    match err {
        DirectoryError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        DirectoryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        DirectoryError::Invalid(_) => StatusCode::BAD_REQUEST,
    }
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
