//! Wire protocol frames.
//!
//! Every message on the wire is one JSON object with a `type` discriminator:
//! `{type, room_id?, content}` plus, for room events, `event_id`, `sender`
//! and `timestamp`. Client→server types carry the `c.*` prefix, server→
//! client the `m.*` prefix (`s.challenge` opens the P2P handshake).
//!
//! Frames are decoded once at the boundary into the closed [`ClientCommand`]
//! enum and matched exhaustively from there; unknown or malformed frames
//! decode to `None` and are dropped by the dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{HISTORY_REPLAY_LIMIT, PROTOCOL_VERSION};

/// One wire frame, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

impl Frame {
    pub fn new(kind: &str, content: Value) -> Self {
        Self {
            kind: kind.to_string(),
            room_id: None,
            event_id: None,
            sender: None,
            timestamp: None,
            content,
        }
    }

    pub fn with_room(mut self, room_id: &str) -> Self {
        self.room_id = Some(room_id.to_string());
        self
    }

    /// Parse a frame from raw JSON text. Returns `None` for anything that
    /// is not a JSON object with a string `type`.
    pub fn parse(raw: &str) -> Option<Frame> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> String {
        // A Frame contains only string keys and JSON values; serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    // -- Server frame constructors ------------------------------------------

    pub fn error(code: ErrorCode, message: &str) -> Frame {
        Frame::new(
            "m.error",
            json!({ "code": code.as_str(), "error": message }),
        )
    }

    pub fn pong() -> Frame {
        Frame::new("m.pong", Value::Null)
    }

    pub fn auth_challenge(challenge_hex: &str, server_name: &str) -> Frame {
        Frame::new(
            "m.auth.challenge",
            json!({
                "challenge": challenge_hex,
                "version": PROTOCOL_VERSION,
                "server": server_name,
            }),
        )
    }

    pub fn auth_ok(username: &str, server_name: &str) -> Frame {
        Frame::new(
            "m.auth.ok",
            json!({
                "username": username,
                "version": PROTOCOL_VERSION,
                "server_name": server_name,
            }),
        )
    }

    pub fn member_event(room_id: &str, username: &str, membership: &str) -> Frame {
        Frame::new(
            "m.room.member",
            json!({ "username": username, "membership": membership }),
        )
        .with_room(room_id)
    }
}

/// Machine-readable error codes carried in `m.error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    TooLarge,
    FileError,
    BadParam,
    UserInUse,
    Banned,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "M_UNAUTHORIZED",
            ErrorCode::Forbidden => "M_FORBIDDEN",
            ErrorCode::NotFound => "M_NOT_FOUND",
            ErrorCode::RateLimited => "M_RATE_LIMITED",
            ErrorCode::TooLarge => "M_TOO_LARGE",
            ErrorCode::FileError => "M_FILE_ERROR",
            ErrorCode::BadParam => "M_BAD_PARAM",
            ErrorCode::UserInUse => "M_USER_IN_USE",
            ErrorCode::Banned => "M_BANNED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client command payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthReply {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomCreateReq {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub public: bool,
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomJoinReq {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileBeginReq {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
}

/// Chunk frames name their stream `transfer_id` on the LAN transport and
/// `file_id` on the P2P transport; both decode into this struct.
#[derive(Debug, Clone, Deserialize)]
pub struct FileChunkReq {
    #[serde(default)]
    pub transfer_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub data: String,
}

impl FileChunkReq {
    pub fn stream_id(&self) -> &str {
        if self.transfer_id.is_empty() {
            &self.file_id
        } else {
            &self.transfer_id
        }
    }
}

/// P2P join handshake reply (`c.auth` on the P2P transport).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pAuthReply {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub did: String,
    #[serde(default)]
    pub session_pubkey: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub room_password: String,
}

/// Why a P2P join was refused (`m.auth.fail` reason field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    Timeout,
    BadType,
    NoUsername,
    UsernameTaken,
    WrongPassword,
}

impl JoinRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinRejection::Timeout => "timeout",
            JoinRejection::BadType => "bad_type",
            JoinRejection::NoUsername => "no_username",
            JoinRejection::UsernameTaken => "username_taken",
            JoinRejection::WrongPassword => "wrong_password",
        }
    }
}

impl fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> u32 {
    HISTORY_REPLAY_LIMIT * 2
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryReq {
    #[serde(default = "default_history_limit")]
    limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct TargetReq {
    #[serde(default)]
    username: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TopicReq {
    #[serde(default)]
    topic: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BodyReq {
    #[serde(default)]
    body: String,
    #[serde(default)]
    sig: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TransferRef {
    #[serde(default)]
    transfer_id: String,
    #[serde(default)]
    file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FileRef {
    #[serde(default)]
    file_id: String,
}

// ---------------------------------------------------------------------------
// The closed command set
// ---------------------------------------------------------------------------

/// Every client→server frame the dispatcher understands, decoded once at
/// the frame boundary.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Auth(AuthReply),
    RoomCreate(RoomCreateReq),
    RoomJoin(RoomJoinReq),
    RoomLeave,
    RoomList,
    RoomHistory { limit: u32 },
    RoomTopic { topic: String },
    RoomKick { username: String },
    RoomBan { username: String, reason: String },
    RoomPromote { username: String },
    RoomFiles,
    Message { body: String, sig: String },
    FileBegin(FileBeginReq),
    FileChunk(FileChunkReq),
    FileEnd { stream_id: String },
    FileGet { file_id: String },
    Users,
    Ping,
}

impl ClientCommand {
    /// Decode a parsed frame into a command. Unknown types and payloads
    /// that fail to deserialize yield `None`.
    pub fn decode(frame: &Frame) -> Option<ClientCommand> {
        let content = frame.content.clone();
        match frame.kind.as_str() {
            "c.auth" => from_value(content).map(ClientCommand::Auth),
            "c.room.create" => from_value(content).map(ClientCommand::RoomCreate),
            "c.room.join" => from_value(content).map(ClientCommand::RoomJoin),
            "c.room.leave" => Some(ClientCommand::RoomLeave),
            "c.room.list" => Some(ClientCommand::RoomList),
            "c.room.history" => from_value::<HistoryReq>(content)
                .map(|r| ClientCommand::RoomHistory { limit: r.limit }),
            "c.room.topic" => from_value::<TopicReq>(content)
                .map(|r| ClientCommand::RoomTopic { topic: r.topic }),
            "c.room.kick" => from_value::<TargetReq>(content)
                .map(|r| ClientCommand::RoomKick { username: r.username }),
            "c.room.ban" => from_value::<TargetReq>(content).map(|r| ClientCommand::RoomBan {
                username: r.username,
                reason: r.reason,
            }),
            "c.room.promote" => from_value::<TargetReq>(content)
                .map(|r| ClientCommand::RoomPromote { username: r.username }),
            "c.room.files" => Some(ClientCommand::RoomFiles),
            "c.message" => from_value::<BodyReq>(content).map(|r| ClientCommand::Message {
                body: r.body,
                sig: r.sig,
            }),
            "c.file.begin" => from_value(content).map(ClientCommand::FileBegin),
            "c.file.chunk" => from_value(content).map(ClientCommand::FileChunk),
            "c.file.end" => from_value::<TransferRef>(content).map(|r| ClientCommand::FileEnd {
                stream_id: if r.transfer_id.is_empty() {
                    r.file_id
                } else {
                    r.transfer_id
                },
            }),
            "c.file.get" => from_value::<FileRef>(content)
                .map(|r| ClientCommand::FileGet { file_id: r.file_id }),
            "c.users" => Some(ClientCommand::Users),
            "c.ping" => Some(ClientCommand::Ping),
            _ => None,
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Option<T> {
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new("c.message", json!({ "body": "hello" })).with_room("!abc:lan");
        let raw = frame.to_json();
        let parsed = Frame::parse(&raw).unwrap();
        assert_eq!(parsed.kind, "c.message");
        assert_eq!(parsed.room_id.as_deref(), Some("!abc:lan"));
        assert_eq!(parsed.content["body"], "hello");
    }

    #[test]
    fn decode_known_commands() {
        let frame = Frame::parse(
            r#"{"type":"c.room.create","content":{"name":"Lab","password":"secret"}}"#,
        )
        .unwrap();
        match ClientCommand::decode(&frame) {
            Some(ClientCommand::RoomCreate(req)) => {
                assert_eq!(req.name, "Lab");
                assert!(req.public); // defaults to true
                assert!(req.topic.is_empty());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_dropped() {
        let frame = Frame::parse(r#"{"type":"c.bogus","content":{}}"#).unwrap();
        assert!(ClientCommand::decode(&frame).is_none());
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(Frame::parse("not json").is_none());
        assert!(Frame::parse(r#"{"no_type": 1}"#).is_none());
    }

    #[test]
    fn error_frame_carries_code() {
        let frame = Frame::error(ErrorCode::RateLimited, "Slow down.");
        assert_eq!(frame.kind, "m.error");
        assert_eq!(frame.content["code"], "M_RATE_LIMITED");
    }

    #[test]
    fn ping_needs_no_content() {
        let frame = Frame::parse(r#"{"type":"c.ping"}"#).unwrap();
        assert!(matches!(
            ClientCommand::decode(&frame),
            Some(ClientCommand::Ping)
        ));
    }
}
