//! Chat service — room-wide text messages.
//!
//! Chat is fan-out only: messages go to every subscriber of
//! `room/{id}/chat`, sender included, and are not stored.

use tracing::debug;

use crate::frame::{Data, Frame, MessageType};
use crate::router::Delivery;
use crate::state::AppState;
use crate::topic::{ConnId, Topic};

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_CHARS: usize = 4_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnId),
    #[error("{0}")]
    Invalid(String),
}

impl crate::frame::ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "E_CONNECTION_NOT_FOUND",
            Self::Invalid(_) => "E_INVALID",
        }
    }
}

/// Publish a chat message from `conn_id` to its room.
///
/// # Errors
///
/// Returns `Invalid` for blank or oversized messages and
/// `ConnectionNotFound` when the connection is gone.
pub async fn send(state: &AppState, conn_id: ConnId, content: &str) -> Result<Delivery, ChatError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::Invalid("message must not be empty".into()));
    }
    if content.chars().count() > MAX_CHAT_CHARS {
        return Err(ChatError::Invalid(format!("message exceeds {MAX_CHAT_CHARS} characters")));
    }
    let Some(conn) = state.connections.get(conn_id).await else {
        return Err(ChatError::ConnectionNotFound(conn_id));
    };

    let frame = Frame::request(MessageType::Chat, Data::new())
        .with_room_id(&conn.room_id)
        .with_from(&conn.user)
        .with_content(content);
    let delivery = state.router.publish(&Topic::chat(&conn.room_id), frame).await;
    debug!(%conn_id, room_id = %conn.room_id, delivered = delivery.delivered, "chat: message published");
    Ok(delivery)
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
