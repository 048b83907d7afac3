use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use parley_shared::Role;

/// A chat room as persisted. Membership lives in its own table and is
/// attached when rooms are loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub name: String,
    /// Username only; no network address is ever persisted.
    pub creator: String,
    pub password_hash: String,
    pub password_salt: String,
    pub public: bool,
    pub created_at: i64,
    pub topic: String,
    #[serde(default)]
    pub members: HashMap<String, Role>,
}

impl Room {
    /// Public metadata safe to show non-members in a room listing.
    pub fn display(&self) -> Value {
        json!({
            "room_id": self.room_id,
            "name": self.name,
            "topic": self.topic,
            "creator": self.creator,
            "public": self.public,
            "member_count": self.members.len(),
            "created_at": self.created_at,
        })
    }
}

/// One immutable chat event (message, file notice, presence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    pub timestamp: i64,
}

/// Metadata of a completed, content-addressed file upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_id: String,
    pub room_id: String,
    pub sender: String,
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    /// Name of the blob on disk: the SHA-256 checksum, never the original
    /// filename.
    pub stored_name: String,
    pub uploaded_at: i64,
}

impl StoredFile {
    /// Listing entry with the server-side storage name stripped.
    pub fn display(&self) -> Value {
        json!({
            "file_id": self.file_id,
            "room_id": self.room_id,
            "sender": self.sender,
            "filename": self.filename,
            "size": self.size,
            "checksum": self.checksum,
            "uploaded_at": self.uploaded_at,
        })
    }
}

/// A remembered room ban.
#[derive(Debug, Clone)]
pub struct BanRecord {
    pub room_id: String,
    pub username: String,
    pub banned_by: String,
    pub reason: String,
    pub banned_at: i64,
}
