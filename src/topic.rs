//! Topic names for the pub/sub fabric.
//!
//! Room topics (`room/{id}/chat|code|presence`) fan out to every member of a
//! room. Connection topics (`conn/{id}/execution-output`) belong to exactly
//! one connection and carry private execution output.

use std::fmt;

use uuid::Uuid;

/// Identifier of a live connection.
pub type ConnId = Uuid;

/// Channels every room exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomChannel {
    Chat,
    Code,
    Presence,
}

impl RoomChannel {
    pub const ALL: [RoomChannel; 3] = [RoomChannel::Chat, RoomChannel::Code, RoomChannel::Presence];

    fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
            Self::Presence => "presence",
        }
    }
}

/// A logical channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Room { room_id: String, channel: RoomChannel },
    ExecutionOutput { conn_id: ConnId },
}

impl Topic {
    #[must_use]
    pub fn room(room_id: &str, channel: RoomChannel) -> Self {
        Self::Room { room_id: room_id.to_owned(), channel }
    }

    #[must_use]
    pub fn chat(room_id: &str) -> Self {
        Self::room(room_id, RoomChannel::Chat)
    }

    #[must_use]
    pub fn code(room_id: &str) -> Self {
        Self::room(room_id, RoomChannel::Code)
    }

    #[must_use]
    pub fn presence(room_id: &str) -> Self {
        Self::room(room_id, RoomChannel::Presence)
    }

    #[must_use]
    pub fn execution_output(conn_id: ConnId) -> Self {
        Self::ExecutionOutput { conn_id }
    }

    /// Private topics admit at most one subscriber: their owning connection.
    #[must_use]
    pub fn owner(&self) -> Option<ConnId> {
        match self {
            Self::Room { .. } => None,
            Self::ExecutionOutput { conn_id } => Some(*conn_id),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room { room_id, channel } => write!(f, "room/{room_id}/{}", channel.as_str()),
            Self::ExecutionOutput { conn_id } => write!(f, "conn/{conn_id}/execution-output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_topics_render_with_room_id() {
        assert_eq!(Topic::chat("ABC234").to_string(), "room/ABC234/chat");
        assert_eq!(Topic::code("ABC234").to_string(), "room/ABC234/code");
        assert_eq!(Topic::presence("ABC234").to_string(), "room/ABC234/presence");
    }

    #[test]
    fn execution_topic_is_owned_by_its_connection() {
        let conn_id = Uuid::new_v4();
        let topic = Topic::execution_output(conn_id);
        assert_eq!(topic.to_string(), format!("conn/{conn_id}/execution-output"));
        assert_eq!(topic.owner(), Some(conn_id));
        assert_eq!(Topic::chat("ABC234").owner(), None);
    }
}
