//! In-memory authoritative server state: the room registry, connected
//! sessions and in-flight transfers, backed by the persistence store.
//!
//! One coarse lock guards the whole struct per server instance. That is
//! acceptable because every critical section is a map lookup or a sync
//! store write; the real concurrency unit is the event loop per connection.
//! Outbound delivery is an unbounded channel push and never awaits, so
//! operations here are plain synchronous methods callable under the lock.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::constants::{
    HISTORY_REPLAY_LIMIT, MAX_HISTORY, MAX_MESSAGE_LEN, MAX_REASON_LEN, MAX_ROOM_NAME_LEN,
    MAX_TOPIC_LEN, MAX_USERNAME_LEN,
};
use parley_shared::crypto::{hash_room_password, make_salt, verify_room_password};
use parley_shared::protocol::{ClientCommand, RoomCreateReq, RoomJoinReq};
use parley_shared::types::{make_event_id, make_room_id, make_token, now_ms, sanitise};
use parley_shared::{ErrorCode, Frame, Realm, Role};
use parley_store::{ChatEvent, Database, Room, StoredFile};

use crate::guard::{AbuseGuard, RateWindow};
use crate::transfer::{self, ChunkOutcome, TransferManager};

/// One authenticated connection.
pub struct Session {
    pub username: String,
    pub origin: IpAddr,
    /// Serialized frames queued to this session's writer task.
    pub tx: mpsc::UnboundedSender<String>,
    pub joined: HashSet<String>,
    pub rate: RateWindow,
}

/// Everything a server instance mutates, behind one lock.
pub struct ServerState {
    pub server_name: String,
    pub db: Database,
    pub transfer_dir: PathBuf,
    pub rooms: HashMap<String, Room>,
    pub sessions: HashMap<String, Session>,
    pub transfers: TransferManager,
    pub guard: AbuseGuard,
}

impl ServerState {
    pub fn new(server_name: &str, db: Database, transfer_dir: PathBuf) -> Self {
        let mut state = Self {
            server_name: server_name.to_string(),
            db,
            transfer_dir,
            rooms: HashMap::new(),
            sessions: HashMap::new(),
            transfers: TransferManager::new(),
            guard: AbuseGuard::new(),
        };
        state.load_persisted_rooms();
        state
    }

    fn load_persisted_rooms(&mut self) {
        match self.db.load_rooms() {
            Ok(rooms) => {
                for room in rooms {
                    self.rooms.insert(room.room_id.clone(), room);
                }
                info!(count = self.rooms.len(), "loaded persisted rooms");
            }
            Err(e) => warn!(error = %e, "could not load persisted rooms"),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// Record an inbound frame against the session's sliding rate window.
    /// Unknown sessions are never allowed.
    pub fn rate_allow(&mut self, username: &str, now: std::time::Instant) -> bool {
        self.sessions
            .get_mut(username)
            .map(|s| s.rate.allow(now))
            .unwrap_or(false)
    }

    // -- Delivery -----------------------------------------------------------

    pub fn send_to(&self, username: &str, frame: &Frame) {
        if let Some(session) = self.sessions.get(username) {
            let _ = session.tx.send(frame.to_json());
        }
    }

    /// Fan a frame out to every current member of a room, optionally
    /// excluding one username (the actor).
    pub fn broadcast(&self, room_id: &str, frame: &Frame, exclude: Option<&str>) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let raw = frame.to_json();
        for username in room.members.keys() {
            if exclude == Some(username.as_str()) {
                continue;
            }
            if let Some(session) = self.sessions.get(username) {
                let _ = session.tx.send(raw.clone());
            }
        }
    }

    /// Mirror a text line into chat for every connected session, regardless
    /// of room membership. Used by the embedding application.
    pub fn broadcast_text(&self, text: &str) {
        let mut frame = Frame::new(
            "m.room.message",
            json!({ "body": sanitise(text, MAX_MESSAGE_LEN), "msgtype": "m.text" }),
        )
        .with_room("*");
        frame.event_id = Some(make_event_id(Realm::Lan));
        frame.sender = Some("[server]".to_string());
        frame.timestamp = Some(now_ms());
        let raw = frame.to_json();
        for session in self.sessions.values() {
            let _ = session.tx.send(raw.clone());
        }
    }

    fn reply_error(&self, username: &str, code: ErrorCode, message: &str) {
        self.send_to(username, &Frame::error(code, message));
    }

    // -- Dispatch -----------------------------------------------------------

    /// Handle one decoded command from an authenticated session. Returns
    /// the `(sender, body)` pair when a chat message should be forwarded to
    /// the embedding application's callback (invoked outside the lock).
    pub fn dispatch(
        &mut self,
        username: &str,
        room_id: Option<&str>,
        command: ClientCommand,
    ) -> Option<(String, String)> {
        let room_id = room_id.unwrap_or("");
        match command {
            ClientCommand::RoomCreate(req) => self.create_room(username, req),
            ClientCommand::RoomJoin(req) => self.join_room(username, req),
            ClientCommand::RoomLeave => self.leave_room(username, room_id),
            ClientCommand::RoomList => self.list_public_rooms(username),
            ClientCommand::RoomHistory { limit } => self.room_history(username, room_id, limit),
            ClientCommand::RoomTopic { topic } => self.set_topic(username, room_id, &topic),
            ClientCommand::RoomKick { username: target } => {
                self.kick(username, room_id, &target)
            }
            ClientCommand::RoomBan {
                username: target,
                reason,
            } => self.ban(username, room_id, &target, &reason),
            ClientCommand::RoomPromote { username: target } => {
                self.promote(username, room_id, &target)
            }
            ClientCommand::RoomFiles => self.list_room_files(username, room_id),
            ClientCommand::Message { body, .. } => {
                return self.message(username, room_id, &body)
            }
            ClientCommand::FileBegin(req) => {
                self.file_begin(username, room_id, &req.filename, req.size, &req.checksum)
            }
            ClientCommand::FileChunk(req) => {
                self.file_chunk(username, req.stream_id(), &req.data)
            }
            ClientCommand::FileEnd { stream_id } => self.file_end(username, &stream_id),
            ClientCommand::FileGet { file_id } => self.file_get(username, &file_id),
            ClientCommand::Users => self.users(username, room_id),
            ClientCommand::Ping => self.send_to(username, &Frame::pong()),
            // c.auth after authentication is just an unknown frame.
            ClientCommand::Auth(_) => {}
        }
        None
    }

    // -- Room registry ------------------------------------------------------

    fn create_room(&mut self, username: &str, req: RoomCreateReq) {
        let name = sanitise(&req.name, MAX_ROOM_NAME_LEN);
        let topic = sanitise(&req.topic, MAX_TOPIC_LEN);
        if name.is_empty() {
            return self.reply_error(username, ErrorCode::BadParam, "Room name required.");
        }
        // A room is never persisted without a password hash.
        if req.password.is_empty() {
            return self.reply_error(username, ErrorCode::BadParam, "Room password required.");
        }

        let salt = make_salt();
        let mut room = Room {
            room_id: make_room_id(Realm::Lan),
            name: name.clone(),
            creator: username.to_string(),
            password_hash: hash_room_password(&req.password, &salt),
            password_salt: salt,
            public: req.public,
            created_at: now_ms(),
            topic,
            members: HashMap::new(),
        };
        room.members.insert(username.to_string(), Role::Admin);

        if let Err(e) = self.db.save_room(&room) {
            warn!(error = %e, "room persist failed");
            return self.reply_error(username, ErrorCode::BadParam, "Could not create room.");
        }
        let _ = self.db.add_member(&room.room_id, username, Role::Admin);

        let room_id = room.room_id.clone();
        self.rooms.insert(room_id.clone(), room);
        if let Some(session) = self.sessions.get_mut(username) {
            session.joined.insert(room_id.clone());
        }

        self.send_to(
            username,
            &Frame::new("m.room.created", json!({ "room_id": room_id, "name": name })),
        );
        info!(room = %room_id, creator = %username, "room created");
    }

    fn join_room(&mut self, username: &str, req: RoomJoinReq) {
        let room_id = req.room_id.as_str();
        let Some(room) = self.rooms.get(room_id) else {
            return self.reply_error(username, ErrorCode::NotFound, "Room not found.");
        };
        if self.db.is_banned(room_id, username).unwrap_or(false) {
            return self.reply_error(username, ErrorCode::Banned, "You are banned from this room.");
        }
        if !verify_room_password(&req.password, &room.password_salt, &room.password_hash) {
            return self.reply_error(username, ErrorCode::Forbidden, "Incorrect room password.");
        }

        let (name, topic) = (room.name.clone(), room.topic.clone());
        let room_id = room_id.to_string();
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.members
                .entry(username.to_string())
                .or_insert(Role::Member);
        }
        if let Some(session) = self.sessions.get_mut(username) {
            session.joined.insert(room_id.clone());
        }
        let _ = self.db.add_member(&room_id, username, Role::Member);

        let history = self
            .db
            .room_history(&room_id, HISTORY_REPLAY_LIMIT)
            .unwrap_or_default();
        let history: Vec<Value> = history
            .iter()
            .map(|ev| serde_json::to_value(ev).unwrap_or_default())
            .collect();

        self.send_to(
            username,
            &Frame::new(
                "m.room.joined",
                json!({ "name": name, "topic": topic, "history": history }),
            )
            .with_room(&room_id),
        );
        self.broadcast(
            &room_id,
            &Frame::member_event(&room_id, username, "joined"),
            Some(username),
        );
    }

    /// Idempotent: leaving a room the session is not in is a no-op.
    fn leave_room(&mut self, username: &str, room_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if room.members.remove(username).is_none() {
            return;
        }
        if let Some(session) = self.sessions.get_mut(username) {
            session.joined.remove(room_id);
        }
        let _ = self.db.remove_member(room_id, username);
        self.broadcast(
            room_id,
            &Frame::member_event(room_id, username, "left"),
            Some(username),
        );
    }

    fn list_public_rooms(&self, username: &str) {
        let rooms: Vec<Value> = self
            .rooms
            .values()
            .filter(|r| r.public)
            .map(|r| r.display())
            .collect();
        self.send_to(
            username,
            &Frame::new("m.room.list", json!({ "rooms": rooms })),
        );
    }

    fn room_history(&self, username: &str, room_id: &str, limit: u32) {
        if !self.is_member(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
        }
        let events = self
            .db
            .room_history(room_id, limit.min(MAX_HISTORY))
            .unwrap_or_default();
        let events: Vec<Value> = events
            .iter()
            .map(|ev| serde_json::to_value(ev).unwrap_or_default())
            .collect();
        self.send_to(
            username,
            &Frame::new("m.room.history", json!({ "events": events })).with_room(room_id),
        );
    }

    fn set_topic(&mut self, username: &str, room_id: &str, topic: &str) {
        if !self.is_admin(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Admins only.");
        }
        let topic = sanitise(topic, MAX_TOPIC_LEN);
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.topic = topic.clone();
            let _ = self.db.save_room(room);
        }
        self.broadcast(
            room_id,
            &Frame::new("m.room.topic", json!({ "topic": topic, "by": username }))
                .with_room(room_id),
            None,
        );
    }

    fn kick(&mut self, username: &str, room_id: &str, target: &str) {
        let target = sanitise(target, MAX_USERNAME_LEN);
        if !self.is_admin(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Admins only.");
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        if room.members.remove(&target).is_none() {
            return self.reply_error(username, ErrorCode::NotFound, "User not in room.");
        }
        if let Some(session) = self.sessions.get_mut(&target) {
            session.joined.remove(room_id);
        }
        let _ = self.db.remove_member(room_id, &target);

        self.send_to(
            &target,
            &Frame::new("m.room.kicked", json!({ "by": username })).with_room(room_id),
        );
        self.broadcast(
            room_id,
            &Frame::member_event(room_id, &target, "kicked"),
            Some(username),
        );
    }

    fn ban(&mut self, username: &str, room_id: &str, target: &str, reason: &str) {
        let target = sanitise(target, MAX_USERNAME_LEN);
        let reason = sanitise(reason, MAX_REASON_LEN);
        if !self.is_admin(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Admins only.");
        }
        let _ = self.db.ban_member(room_id, &target, username, &reason);
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.remove(&target);
        }
        if let Some(session) = self.sessions.get_mut(&target) {
            session.joined.remove(room_id);
        }

        self.send_to(
            &target,
            &Frame::new("m.room.banned", json!({ "reason": reason })).with_room(room_id),
        );
        self.broadcast(
            room_id,
            &Frame::member_event(room_id, &target, "banned"),
            Some(username),
        );
    }

    fn promote(&mut self, username: &str, room_id: &str, target: &str) {
        let target = sanitise(target, MAX_USERNAME_LEN);
        if !self.is_admin(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Admins only.");
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let Some(role) = room.members.get_mut(&target) else {
            return self.reply_error(username, ErrorCode::NotFound, "User not in room.");
        };
        *role = Role::Admin;
        let _ = self.db.add_member(room_id, &target, Role::Admin);
        self.broadcast(
            room_id,
            &Frame::member_event(room_id, &target, "promoted"),
            Some(username),
        );
    }

    fn users(&self, username: &str, room_id: &str) {
        let Some(room) = self.rooms.get(room_id) else {
            return self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
        };
        // Only the count and the caller's own role, never the member list.
        let Some(role) = room.members.get(username) else {
            return self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
        };
        self.send_to(
            username,
            &Frame::new(
                "m.users",
                json!({ "count": room.members.len(), "your_role": role.as_str() }),
            )
            .with_room(room_id),
        );
    }

    // -- Messaging ----------------------------------------------------------

    fn message(
        &mut self,
        username: &str,
        room_id: &str,
        body: &str,
    ) -> Option<(String, String)> {
        if !self.is_member(room_id, username) {
            self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
            return None;
        }
        let body = sanitise(body, MAX_MESSAGE_LEN);
        if body.is_empty() {
            return None;
        }

        let event = ChatEvent {
            event_id: make_event_id(Realm::Lan),
            room_id: room_id.to_string(),
            sender: username.to_string(),
            kind: "m.room.message".to_string(),
            content: json!({ "body": body, "msgtype": "m.text" }),
            timestamp: now_ms(),
        };
        let _ = self.db.save_event(&event);
        self.broadcast(room_id, &event_frame(&event), None);

        Some((username.to_string(), body))
    }

    // -- File transfer ------------------------------------------------------

    fn file_begin(
        &mut self,
        username: &str,
        room_id: &str,
        filename: &str,
        size: u64,
        checksum: &str,
    ) {
        if !self.is_member(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
        }
        match self
            .transfers
            .begin(room_id, username, filename, size, checksum)
        {
            Ok(transfer_id) => self.send_to(
                username,
                &Frame::new("m.file.ready", json!({ "transfer_id": transfer_id })),
            ),
            Err(code) => self.reply_error(username, code, "File exceeds 50 MiB limit."),
        }
    }

    fn file_chunk(&mut self, username: &str, transfer_id: &str, data_b64: &str) {
        match self.transfers.append(transfer_id, username, data_b64) {
            ChunkOutcome::Accepted | ChunkOutcome::Ignored => {}
            ChunkOutcome::Rejected(code) => {
                self.reply_error(username, code, "Transfer aborted.");
            }
        }
    }

    fn file_end(&mut self, username: &str, transfer_id: &str) {
        let Some(done) = self.transfers.finish(transfer_id, username) else {
            return;
        };
        let bytes = match transfer::verify(&done) {
            Ok(bytes) => bytes.to_vec(),
            Err(code) => {
                let reason = match code {
                    ErrorCode::TooLarge => "File too large.",
                    _ => "Size or checksum mismatch.",
                };
                return self.reply_error(username, code, reason);
            }
        };
        let stored_name = match transfer::store_blob(&self.transfer_dir, &bytes) {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "blob write failed");
                return self.reply_error(username, ErrorCode::FileError, "Storage failed.");
            }
        };

        let file = StoredFile {
            file_id: make_token(),
            room_id: done.room_id.clone(),
            sender: done.sender.clone(),
            filename: done.filename.clone(),
            size: bytes.len() as u64,
            checksum: stored_name.clone(),
            stored_name,
            uploaded_at: now_ms(),
        };
        let _ = self.db.save_file(&file);

        let event = ChatEvent {
            event_id: make_event_id(Realm::Lan),
            room_id: file.room_id.clone(),
            sender: file.sender.clone(),
            kind: "m.room.file".to_string(),
            content: json!({
                "file_id": file.file_id,
                "filename": file.filename,
                "size": file.size,
                "checksum": file.checksum,
            }),
            timestamp: now_ms(),
        };
        let _ = self.db.save_event(&event);
        self.broadcast(&file.room_id, &event_frame(&event), None);
        info!(
            filename = %file.filename,
            size = file.size,
            sender = %file.sender,
            "file stored"
        );
    }

    fn file_get(&mut self, username: &str, file_id: &str) {
        let Ok(meta) = self.db.get_file(file_id) else {
            return self.reply_error(username, ErrorCode::NotFound, "File not found.");
        };
        if !self.is_member(&meta.room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
        }
        let Some(bytes) = transfer::load_blob(&self.transfer_dir, &meta.stored_name) else {
            return self.reply_error(username, ErrorCode::NotFound, "File data missing.");
        };

        let chunks = transfer::encode_chunks(&bytes, parley_shared::constants::LAN_CHUNK_BYTES);
        self.send_to(
            username,
            &Frame::new(
                "m.file.begin",
                json!({
                    "file_id": meta.file_id,
                    "filename": meta.filename,
                    "size": bytes.len(),
                    "checksum": meta.checksum,
                    "chunks": chunks.len(),
                }),
            ),
        );
        for chunk in chunks {
            self.send_to(
                username,
                &Frame::new(
                    "m.file.chunk",
                    json!({ "file_id": meta.file_id, "data": chunk }),
                ),
            );
        }
        self.send_to(
            username,
            &Frame::new("m.file.end", json!({ "file_id": meta.file_id })),
        );
    }

    fn list_room_files(&self, username: &str, room_id: &str) {
        if !self.is_member(room_id, username) {
            return self.reply_error(username, ErrorCode::Forbidden, "Not in room.");
        }
        let files: Vec<Value> = self
            .db
            .list_files(room_id)
            .unwrap_or_default()
            .iter()
            .map(|f| f.display())
            .collect();
        self.send_to(
            username,
            &Frame::new("m.room.files", json!({ "files": files })).with_room(room_id),
        );
    }

    // -- Session lifecycle --------------------------------------------------

    /// Remove a disconnecting session from every joined room, emitting
    /// member-left notifications, and drop its in-flight uploads.
    pub fn disconnect(&mut self, username: &str) {
        let Some(session) = self.sessions.remove(username) else {
            return;
        };
        debug!(username = %username, "session disconnected");
        self.transfers.abort_for_sender(username);
        for room_id in session.joined {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                if room.members.remove(username).is_some() {
                    let _ = self.db.remove_member(&room_id, username);
                    self.broadcast(
                        &room_id,
                        &Frame::member_event(&room_id, username, "left"),
                        Some(username),
                    );
                }
            }
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn is_member(&self, room_id: &str, username: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|r| r.members.contains_key(username))
    }

    fn is_admin(&self, room_id: &str, username: &str) -> bool {
        self.rooms
            .get(room_id)
            .and_then(|r| r.members.get(username))
            .is_some_and(|role| *role == Role::Admin)
    }
}

/// Render a persisted event as a wire frame.
fn event_frame(event: &ChatEvent) -> Frame {
    let mut frame = Frame::new(&event.kind, event.content.clone()).with_room(&event.room_id);
    frame.event_id = Some(event.event_id.clone());
    frame.sender = Some(event.sender.clone());
    frame.timestamp = Some(event.timestamp);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (ServerState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let state = ServerState::new("Test", db, dir.path().join("transfers"));
        (state, dir)
    }

    fn add_session(state: &mut ServerState, username: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            username.to_string(),
            Session {
                username: username.to_string(),
                origin: "127.0.0.1".parse().unwrap(),
                tx,
                joined: HashSet::new(),
                rate: RateWindow::new(),
            },
        );
        rx
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Frame {
        let raw = rx.try_recv().expect("expected a frame");
        Frame::parse(&raw).expect("valid frame")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            frames.push(Frame::parse(&raw).unwrap());
        }
        frames
    }

    fn create_room(state: &mut ServerState, creator: &str, password: &str) -> String {
        state.dispatch(
            creator,
            None,
            ClientCommand::RoomCreate(RoomCreateReq {
                name: "Lab".to_string(),
                password: password.to_string(),
                public: true,
                topic: String::new(),
            }),
        );
        state.rooms.keys().next().unwrap().clone()
    }

    #[test]
    fn created_room_is_joinable_and_listed() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let room_id = create_room(&mut state, "alice", "secret");

        let created = next_frame(&mut alice);
        assert_eq!(created.kind, "m.room.created");
        assert_eq!(created.content["room_id"], room_id);

        // Creator is admin immediately
        assert!(state.is_admin(&room_id, "alice"));

        state.dispatch("alice", None, ClientCommand::RoomList);
        let listing = next_frame(&mut alice);
        assert_eq!(listing.content["rooms"][0]["room_id"], room_id);
    }

    #[test]
    fn empty_password_is_rejected_at_creation() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        state.dispatch(
            "alice",
            None,
            ClientCommand::RoomCreate(RoomCreateReq {
                name: "Lab".to_string(),
                password: String::new(),
                public: true,
                topic: String::new(),
            }),
        );
        let reply = next_frame(&mut alice);
        assert_eq!(reply.content["code"], "M_BAD_PARAM");
        assert!(state.rooms.is_empty());
    }

    #[test]
    fn wrong_password_leaves_membership_unchanged() {
        let (mut state, _dir) = test_state();
        let _alice = add_session(&mut state, "alice");
        let mut bob = add_session(&mut state, "bob");
        let room_id = create_room(&mut state, "alice", "secret");

        state.dispatch(
            "bob",
            None,
            ClientCommand::RoomJoin(RoomJoinReq {
                room_id: room_id.clone(),
                password: "wrong".to_string(),
            }),
        );
        let reply = next_frame(&mut bob);
        assert_eq!(reply.kind, "m.error");
        assert_eq!(reply.content["code"], "M_FORBIDDEN");
        assert_eq!(state.rooms[&room_id].members.len(), 1);
    }

    #[test]
    fn join_replays_history_and_notifies_members() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let mut bob = add_session(&mut state, "bob");
        let room_id = create_room(&mut state, "alice", "secret");
        drain(&mut alice);

        state.dispatch("alice", Some(room_id.as_str()), ClientCommand::Message {
            body: "hello".to_string(),
            sig: String::new(),
        });
        drain(&mut alice);

        state.dispatch(
            "bob",
            None,
            ClientCommand::RoomJoin(RoomJoinReq {
                room_id: room_id.clone(),
                password: "secret".to_string(),
            }),
        );
        let joined = next_frame(&mut bob);
        assert_eq!(joined.kind, "m.room.joined");
        let history = joined.content["history"].as_array().unwrap();
        assert_eq!(
            history.last().unwrap()["content"]["body"],
            "hello"
        );

        // Alice sees the presence event, excluding the actor themselves
        let presence = next_frame(&mut alice);
        assert_eq!(presence.kind, "m.room.member");
        assert_eq!(presence.content["membership"], "joined");
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn leave_is_idempotent() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let room_id = create_room(&mut state, "alice", "secret");
        drain(&mut alice);

        // bob was never a member; no error, no event
        let mut bob = add_session(&mut state, "bob");
        state.dispatch("bob", Some(room_id.as_str()), ClientCommand::RoomLeave);
        assert!(bob.try_recv().is_err());
        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn non_admin_cannot_set_topic() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let mut bob = add_session(&mut state, "bob");
        let room_id = create_room(&mut state, "alice", "secret");
        state.dispatch(
            "bob",
            None,
            ClientCommand::RoomJoin(RoomJoinReq {
                room_id: room_id.clone(),
                password: "secret".to_string(),
            }),
        );
        drain(&mut alice);
        drain(&mut bob);

        state.dispatch("bob", Some(room_id.as_str()), ClientCommand::RoomTopic {
            topic: "hijacked".to_string(),
        });
        let reply = next_frame(&mut bob);
        assert_eq!(reply.content["code"], "M_FORBIDDEN");
        assert_eq!(state.rooms[&room_id].topic, "");
    }

    #[test]
    fn banned_user_cannot_rejoin() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let mut bob = add_session(&mut state, "bob");
        let room_id = create_room(&mut state, "alice", "secret");
        state.dispatch(
            "bob",
            None,
            ClientCommand::RoomJoin(RoomJoinReq {
                room_id: room_id.clone(),
                password: "secret".to_string(),
            }),
        );
        drain(&mut alice);
        drain(&mut bob);

        state.dispatch("alice", Some(room_id.as_str()), ClientCommand::RoomBan {
            username: "bob".to_string(),
            reason: "spam".to_string(),
        });
        let notice = next_frame(&mut bob);
        assert_eq!(notice.kind, "m.room.banned");
        assert!(!state.rooms[&room_id].members.contains_key("bob"));

        state.dispatch(
            "bob",
            None,
            ClientCommand::RoomJoin(RoomJoinReq {
                room_id: room_id.clone(),
                password: "secret".to_string(),
            }),
        );
        let rejected = next_frame(&mut bob);
        assert_eq!(rejected.content["code"], "M_BANNED");
    }

    #[test]
    fn message_requires_membership() {
        let (mut state, _dir) = test_state();
        let _alice = add_session(&mut state, "alice");
        let mut mallory = add_session(&mut state, "mallory");
        let room_id = create_room(&mut state, "alice", "secret");

        let callback = state.dispatch("mallory", Some(room_id.as_str()), ClientCommand::Message {
            body: "spam".to_string(),
            sig: String::new(),
        });
        assert!(callback.is_none());
        let reply = next_frame(&mut mallory);
        assert_eq!(reply.content["code"], "M_FORBIDDEN");
    }

    #[test]
    fn message_is_persisted_and_reported_for_callback() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let room_id = create_room(&mut state, "alice", "secret");
        drain(&mut alice);

        let callback = state.dispatch("alice", Some(room_id.as_str()), ClientCommand::Message {
            body: "hello".to_string(),
            sig: String::new(),
        });
        assert_eq!(callback, Some(("alice".to_string(), "hello".to_string())));

        let echoed = next_frame(&mut alice);
        assert_eq!(echoed.kind, "m.room.message");
        assert_eq!(echoed.content["body"], "hello");
        assert_eq!(state.db.room_history(&room_id, 10).unwrap().len(), 1);
    }

    #[test]
    fn disconnect_leaves_all_rooms() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let mut bob = add_session(&mut state, "bob");
        let room_id = create_room(&mut state, "alice", "secret");
        state.dispatch(
            "bob",
            None,
            ClientCommand::RoomJoin(RoomJoinReq {
                room_id: room_id.clone(),
                password: "secret".to_string(),
            }),
        );
        drain(&mut alice);
        drain(&mut bob);

        state.disconnect("bob");
        assert!(!state.rooms[&room_id].members.contains_key("bob"));
        let left = next_frame(&mut alice);
        assert_eq!(left.content["membership"], "left");
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn broadcast_text_reaches_every_session() {
        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let mut bob = add_session(&mut state, "bob");

        state.broadcast_text("transcript line");
        for rx in [&mut alice, &mut bob] {
            let frame = next_frame(rx);
            assert_eq!(frame.kind, "m.room.message");
            assert_eq!(frame.content["body"], "transcript line");
            assert_eq!(frame.sender.as_deref(), Some("[server]"));
        }
    }

    #[test]
    fn upload_then_download_round_trips() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        use parley_shared::crypto::sha256_hex;
        use parley_shared::protocol::{FileBeginReq, FileChunkReq};

        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let room_id = create_room(&mut state, "alice", "secret");
        drain(&mut alice);

        let payload = b"file contents".to_vec();
        state.dispatch(
            "alice",
            Some(room_id.as_str()),
            ClientCommand::FileBegin(FileBeginReq {
                filename: "notes.txt".to_string(),
                size: payload.len() as u64,
                checksum: sha256_hex(&payload),
            }),
        );
        let ready = next_frame(&mut alice);
        assert_eq!(ready.kind, "m.file.ready");
        let tid = ready.content["transfer_id"].as_str().unwrap().to_string();

        state.dispatch(
            "alice",
            Some(room_id.as_str()),
            ClientCommand::FileChunk(FileChunkReq {
                transfer_id: tid.clone(),
                file_id: String::new(),
                data: BASE64.encode(&payload),
            }),
        );
        state.dispatch("alice", Some(room_id.as_str()), ClientCommand::FileEnd {
            stream_id: tid,
        });
        let stored = next_frame(&mut alice);
        assert_eq!(stored.kind, "m.room.file");
        let file_id = stored.content["file_id"].as_str().unwrap().to_string();

        state.dispatch("alice", None, ClientCommand::FileGet { file_id });
        let begin = next_frame(&mut alice);
        assert_eq!(begin.kind, "m.file.begin");
        let chunk = next_frame(&mut alice);
        let bytes = BASE64
            .decode(chunk.content["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(next_frame(&mut alice).kind, "m.file.end");
    }

    #[test]
    fn corrupted_upload_is_never_stored() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        use parley_shared::crypto::sha256_hex;
        use parley_shared::protocol::{FileBeginReq, FileChunkReq};

        let (mut state, _dir) = test_state();
        let mut alice = add_session(&mut state, "alice");
        let room_id = create_room(&mut state, "alice", "secret");
        drain(&mut alice);

        state.dispatch(
            "alice",
            Some(room_id.as_str()),
            ClientCommand::FileBegin(FileBeginReq {
                filename: "x".to_string(),
                size: 4,
                checksum: sha256_hex(b"good"),
            }),
        );
        let tid = next_frame(&mut alice).content["transfer_id"]
            .as_str()
            .unwrap()
            .to_string();
        state.dispatch(
            "alice",
            Some(room_id.as_str()),
            ClientCommand::FileChunk(FileChunkReq {
                transfer_id: tid.clone(),
                file_id: String::new(),
                data: BASE64.encode(b"evil"),
            }),
        );
        state.dispatch("alice", Some(room_id.as_str()), ClientCommand::FileEnd {
            stream_id: tid,
        });

        let reply = next_frame(&mut alice);
        assert_eq!(reply.content["code"], "M_FILE_ERROR");
        assert!(state.db.list_files(&room_id).unwrap().is_empty());
    }
}
