//! Room directory — room metadata, credentials, and membership.
//!
//! ARCHITECTURE
//! ============
//! The directory is the collaborator that owns rooms outside the live
//! session: it creates rooms, gates joins on the room credential, tracks the
//! member list, and keeps the last flushed `{code, language}` snapshot. The
//! realtime core only asks it yes/no questions at session boundaries and
//! trusts the answer.
//!
//! `InMemoryDirectory` is the bundled implementation. Credentials are stored
//! as salted SHA-256 digests; the plaintext is echoed only in the create
//! response.

use std::collections::HashMap;
use std::fmt::Write;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Alphabet for human-typable room ids (no `0/O`, `1/I`).
pub const ROOM_ID_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_ID_LENGTH: usize = 6;
pub const MIN_CREDENTIAL_LEN: usize = 4;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("invalid credential for room {0}")]
    Unauthorized(String),
    #[error("{0}")]
    Invalid(String),
}

impl crate::frame::ErrorCode for DirectoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::Unauthorized(_) => "E_UNAUTHORIZED",
            Self::Invalid(_) => "E_INVALID",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateRoom {
    pub name: String,
    pub credential: String,
    pub creator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedRoom {
    pub room_id: String,
    pub name: String,
    pub credential: String,
    pub creator: String,
    pub current_code: String,
    pub current_language: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub name: String,
    pub creator: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedRoom {
    pub room_id: String,
    pub name: String,
    pub current_code: String,
    pub current_language: String,
    pub member_count: usize,
}

/// Seam between the realtime core and room storage.
#[async_trait::async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Create a room; the creator becomes its first member.
    async fn create(&self, request: CreateRoom) -> Result<CreatedRoom, DirectoryError>;

    /// Check the credential and add `user` to the member list.
    async fn join(&self, room_id: &str, credential: &str, user: &str) -> Result<JoinedRoom, DirectoryError>;

    async fn leave(&self, room_id: &str, user: &str) -> Result<(), DirectoryError>;

    async fn resolve(&self, room_id: &str) -> Result<RoomInfo, DirectoryError>;

    /// Yes/no credential gate without touching membership.
    async fn authorize(&self, room_id: &str, credential: &str) -> Result<(), DirectoryError>;

    /// Persist the latest buffer snapshot.
    async fn store_code(&self, room_id: &str, code: &str, language: &str) -> Result<(), DirectoryError>;
}

// =============================================================================
// HELPERS
// =============================================================================

/// Canonical form of a user-typed room id.
#[must_use]
pub fn normalize_room_id(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[must_use]
pub fn generate_room_id() -> String {
    let mut rng = rand::rng();
    (0..ROOM_ID_LENGTH)
        .map(|_| char::from(ROOM_ID_CHARS[rng.random_range(0..ROOM_ID_CHARS.len())]))
        .collect()
}

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

fn hash_credential(salt: &str, credential: &str) -> String {
    let digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(b":")
        .chain_update(credential.as_bytes())
        .finalize();
    bytes_to_hex(&digest)
}

fn required(value: &str, what: &str) -> Result<String, DirectoryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DirectoryError::Invalid(format!("{what} is required")));
    }
    Ok(trimmed.to_owned())
}

// =============================================================================
// IN-MEMORY DIRECTORY
// =============================================================================

struct StoredRoom {
    name: String,
    creator: String,
    salt: String,
    credential_hash: String,
    members: Vec<String>,
    current_code: String,
    current_language: String,
}

impl StoredRoom {
    fn credential_matches(&self, credential: &str) -> bool {
        hash_credential(&self.salt, credential) == self.credential_hash
    }
}

pub struct InMemoryDirectory {
    rooms: RwLock<HashMap<String, StoredRoom>>,
    default_language: String,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new(default_language: impl Into<String>) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), default_language: default_language.into() }
    }
}

#[async_trait::async_trait]
impl RoomDirectory for InMemoryDirectory {
    async fn create(&self, request: CreateRoom) -> Result<CreatedRoom, DirectoryError> {
        let name = required(&request.name, "room name")?;
        let creator = required(&request.creator, "creator username")?;
        if request.credential.chars().count() < MIN_CREDENTIAL_LEN {
            return Err(DirectoryError::Invalid(format!(
                "password must be at least {MIN_CREDENTIAL_LEN} characters"
            )));
        }

        let mut rooms = self.rooms.write().await;
        let room_id = loop {
            let candidate = generate_room_id();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        let salt = generate_salt();
        let credential_hash = hash_credential(&salt, &request.credential);
        rooms.insert(
            room_id.clone(),
            StoredRoom {
                name: name.clone(),
                creator: creator.clone(),
                salt,
                credential_hash,
                members: vec![creator.clone()],
                current_code: String::new(),
                current_language: self.default_language.clone(),
            },
        );

        Ok(CreatedRoom {
            room_id,
            name,
            credential: request.credential,
            creator,
            current_code: String::new(),
            current_language: self.default_language.clone(),
            member_count: 1,
        })
    }

    async fn join(&self, room_id: &str, credential: &str, user: &str) -> Result<JoinedRoom, DirectoryError> {
        let room_id = required(room_id, "room id").map(|id| normalize_room_id(&id))?;
        let user = required(user, "username")?;
        if credential.is_empty() {
            return Err(DirectoryError::Invalid("password is required".into()));
        }

        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return Err(DirectoryError::RoomNotFound(room_id));
        };
        if !room.credential_matches(credential) {
            return Err(DirectoryError::Unauthorized(room_id));
        }
        if !room.members.contains(&user) {
            room.members.push(user);
        }

        Ok(JoinedRoom {
            room_id,
            name: room.name.clone(),
            current_code: room.current_code.clone(),
            current_language: room.current_language.clone(),
            member_count: room.members.len(),
        })
    }

    async fn leave(&self, room_id: &str, user: &str) -> Result<(), DirectoryError> {
        let room_id = normalize_room_id(room_id);
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return Err(DirectoryError::RoomNotFound(room_id));
        };
        room.members.retain(|member| member != user.trim());
        Ok(())
    }

    async fn resolve(&self, room_id: &str) -> Result<RoomInfo, DirectoryError> {
        let room_id = normalize_room_id(room_id);
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return Err(DirectoryError::RoomNotFound(room_id));
        };
        Ok(RoomInfo {
            room_id,
            name: room.name.clone(),
            creator: room.creator.clone(),
            member_count: room.members.len(),
        })
    }

    async fn authorize(&self, room_id: &str, credential: &str) -> Result<(), DirectoryError> {
        let room_id = normalize_room_id(room_id);
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return Err(DirectoryError::RoomNotFound(room_id));
        };
        if room.credential_matches(credential) {
            Ok(())
        } else {
            Err(DirectoryError::Unauthorized(room_id))
        }
    }

    async fn store_code(&self, room_id: &str, code: &str, language: &str) -> Result<(), DirectoryError> {
        let room_id = normalize_room_id(room_id);
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return Err(DirectoryError::RoomNotFound(room_id));
        };
        code.clone_into(&mut room.current_code);
        language.clone_into(&mut room.current_language);
        Ok(())
    }
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;
