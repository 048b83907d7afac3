//! Local peer node: identity, Tor lifecycle, hosted rooms and joined rooms.
//!
//! Without a reachable Tor daemon `start` fails with an actionable error
//! and the node stays inert, so nothing can be hosted or joined. Each hosted
//! room gets its own ephemeral rendezvous address mapping the default
//! virtual port to the room's local listener.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{info, warn};

use parley_shared::constants::{
    HIDDEN_SERVICE_BASE_PORT, MAX_FILE_BYTES, MAX_FILENAME_LEN, MAX_MESSAGE_LEN,
    MAX_ROOM_NAME_LEN, MAX_TOPIC_LEN, P2P_CHUNK_BYTES,
};
use parley_shared::crypto::{hash_room_password, make_salt, sha256_hex};
use parley_shared::types::{make_event_id, make_room_id, make_token, now_ms, sanitise};
use parley_shared::{Frame, Realm};

use crate::client::{JoinCredentials, RoomAddress, RoomConnection};
use crate::error::{P2pError, Result};
use crate::host::{EventCallback, HostedRoom, RoomHost};
use crate::profile::IdentityProfile;
use crate::tor::{proxy_reachable, TorController, TOR_HELP};

/// A file being received from a joined room's relay stream.
struct RxFile {
    filename: String,
    checksum: String,
    buffer: Vec<u8>,
}

/// Assembles relayed file streams and forwards everything else.
struct NodeInbox {
    rx_files: Mutex<HashMap<String, RxFile>>,
    download_dir: PathBuf,
    on_event: EventCallback,
}

impl NodeInbox {
    fn handle(&self, frame: Frame) {
        match frame.kind.as_str() {
            "m.file.begin" => {
                let file_id = frame.content["file_id"].as_str().unwrap_or_default();
                let filename = sanitise(
                    Path::new(frame.content["filename"].as_str().unwrap_or("file"))
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("file"),
                    MAX_FILENAME_LEN,
                );
                lock(&self.rx_files).insert(
                    file_id.to_string(),
                    RxFile {
                        filename,
                        checksum: frame.content["checksum"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        buffer: Vec::new(),
                    },
                );
            }
            "m.file.chunk" => {
                let file_id = frame.content["file_id"].as_str().unwrap_or_default();
                let Ok(data) = BASE64.decode(frame.content["data"].as_str().unwrap_or_default())
                else {
                    return;
                };
                let mut files = lock(&self.rx_files);
                if let Some(file) = files.get_mut(file_id) {
                    if file.buffer.len() + data.len() > MAX_FILE_BYTES {
                        warn!(filename = %file.filename, "incoming file over ceiling, dropping");
                        files.remove(file_id);
                        return;
                    }
                    file.buffer.extend_from_slice(&data);
                }
            }
            "m.file.end" => {
                let file_id = frame.content["file_id"].as_str().unwrap_or_default();
                let Some(file) = lock(&self.rx_files).remove(file_id) else {
                    // A relay summary for a stream we never tracked (e.g.
                    // our own upload echoed back) passes straight through.
                    (self.on_event)(frame);
                    return;
                };
                let checksum = sha256_hex(&file.buffer);
                let dest = self.download_dir.join(&file.filename);
                if let Err(e) = std::fs::create_dir_all(&self.download_dir)
                    .and_then(|_| std::fs::write(&dest, &file.buffer))
                {
                    warn!(error = %e, "could not write received file");
                    return;
                }
                (self.on_event)(Frame::new(
                    "m.file.received",
                    json!({
                        "file_id": file_id,
                        "filename": file.filename,
                        "size": file.buffer.len(),
                        "checksum": checksum,
                        "checksum_ok": file.checksum.is_empty() || file.checksum == checksum,
                        "path": dest.to_string_lossy(),
                    }),
                ));
            }
            _ => (self.on_event)(frame),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One hosted room plus the controller keeping its onion alive.
struct Hosting {
    host: RoomHost,
    onion: Option<TorController>,
    address: String,
}

/// The local peer node.
pub struct P2pNode {
    profile: IdentityProfile,
    on_event: EventCallback,
    inbox: Arc<NodeInbox>,
    hosted: HashMap<String, Hosting>,
    joined: HashMap<String, RoomConnection>,
    started: bool,
}

impl P2pNode {
    /// Build a node from the profile at `profile_path` (default platform
    /// location when `None`). Received files land in `download_dir`.
    pub fn new(
        profile_path: Option<&Path>,
        download_dir: PathBuf,
        on_event: EventCallback,
    ) -> Result<Self> {
        let path = match profile_path {
            Some(path) => path.to_path_buf(),
            None => IdentityProfile::default_path()?,
        };
        let profile = IdentityProfile::load_or_create(&path)?;
        let inbox = Arc::new(NodeInbox {
            rx_files: Mutex::new(HashMap::new()),
            download_dir,
            on_event: on_event.clone(),
        });
        Ok(Self {
            profile,
            on_event,
            inbox,
            hosted: HashMap::new(),
            joined: HashMap::new(),
            started: false,
        })
    }

    pub fn username(&self) -> &str {
        self.profile.username()
    }

    pub fn set_username(&mut self, username: &str) {
        self.profile.set_username(username);
    }

    pub fn public_id(&self) -> String {
        self.profile.public_id()
    }

    /// Verify the overlay daemon is reachable. Fails cleanly with a
    /// remediation message otherwise; the node is then fully inert.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if !proxy_reachable() {
            return Err(P2pError::TorUnavailable(TOR_HELP.to_string()));
        }
        // Authenticate once now so a misconfigured control port surfaces at
        // start rather than at the first create_room.
        let probe = TorController::connect()?;
        drop(probe);

        self.started = true;
        info!(
            username = %self.profile.username(),
            public_id = %self.profile.public_id(),
            "node started"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.started = false;
        for (_, mut hosting) in self.hosted.drain() {
            hosting.host.stop();
            if let Some(mut onion) = hosting.onion.take() {
                onion.remove_onion();
            }
        }
        for (_, mut conn) in self.joined.drain() {
            conn.disconnect();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    // -- Rooms --------------------------------------------------------------

    /// Host a new room. Returns the shareable join address
    /// `<rendezvous>.onion/<room_id>`.
    pub fn create_room(
        &mut self,
        name: &str,
        password: &str,
        public: bool,
        topic: &str,
    ) -> Result<String> {
        if !self.started {
            return Err(P2pError::NotStarted);
        }
        let room_id = make_room_id(Realm::P2p);
        let salt = make_salt();
        let password_hash = if password.is_empty() {
            String::new()
        } else {
            hash_room_password(password, &salt)
        };

        let room = HostedRoom {
            room_id: room_id.clone(),
            name: sanitise(name, MAX_ROOM_NAME_LEN),
            creator: self.profile.username().to_string(),
            password_hash,
            password_salt: salt,
            public,
            created_at: now_ms(),
            topic: sanitise(topic, MAX_TOPIC_LEN),
            host_onion: String::new(),
            members: HashMap::from([(
                self.profile.username().to_string(),
                self.profile.public_id(),
            )]),
        };

        let inbox = self.inbox.clone();
        let mut host = RoomHost::new(
            room,
            self.profile.username(),
            Arc::new(move |frame| inbox.handle(frame)),
        );
        if !host.start(0) {
            return Err(P2pError::Handshake("room listener failed to start".to_string()));
        }

        // One rendezvous address per hosted room: the default virtual port
        // maps onto this room's local listener.
        let mut controller = TorController::connect()?;
        let onion = controller.add_onion(HIDDEN_SERVICE_BASE_PORT, host.port())?;
        let address = format!("{onion}/{room_id}");

        info!(room = %room_id, address = %address, "hosting room");
        (self.on_event)(
            Frame::new("m.room.created", host.room_display()).with_room(&room_id),
        );
        self.hosted.insert(
            room_id.clone(),
            Hosting {
                host,
                onion: Some(controller),
                address,
            },
        );
        Ok(room_id)
    }

    /// Join a remote room at `<rendezvous>/<room_id>`.
    pub fn join_room(&mut self, address: &str, password: &str) -> Result<String> {
        if !self.started {
            return Err(P2pError::NotStarted);
        }
        let address = RoomAddress::parse(address)?;
        let room_id = address.room_id.clone();
        if self.joined.contains_key(&room_id) || self.hosted.contains_key(&room_id) {
            return Ok(room_id);
        }

        let credentials = JoinCredentials {
            username: self.profile.username().to_string(),
            did: self.profile.public_id(),
            session_pubkey: self.profile.session_pubkey_hex(),
            auth_token: self.profile.auth_token(),
            room_password: password.to_string(),
        };
        let inbox = self.inbox.clone();
        let conn = RoomConnection::connect(
            address,
            credentials,
            Arc::new(move |frame| inbox.handle(frame)),
        )?;

        info!(room = %room_id, name = %conn.room_name(), "joined room");
        self.joined.insert(room_id.clone(), conn);
        Ok(room_id)
    }

    /// Stop hosting or leave a joined room. Unknown ids are a no-op.
    pub fn leave_room(&mut self, room_id: &str) {
        if let Some(mut hosting) = self.hosted.remove(room_id) {
            hosting.host.stop();
            if let Some(mut onion) = hosting.onion.take() {
                onion.remove_onion();
            }
        } else if let Some(mut conn) = self.joined.remove(room_id) {
            conn.disconnect();
        }
    }

    pub fn send_message(&self, room_id: &str, text: &str) {
        let body = sanitise(text, MAX_MESSAGE_LEN);
        if body.is_empty() {
            return;
        }
        let sig = self.profile.sign(body.as_bytes());

        if let Some(hosting) = self.hosted.get(room_id) {
            let mut event = Frame::new(
                "m.room.message",
                json!({
                    "body": body,
                    "msgtype": "m.text",
                    "did": self.profile.public_id(),
                    "sig": sig,
                }),
            )
            .with_room(room_id);
            event.event_id = Some(make_event_id(Realm::P2p));
            event.sender = Some(self.profile.username().to_string());
            event.timestamp = Some(now_ms());

            hosting.host.send_to_all(&event);
            (self.on_event)(event);
        } else if let Some(conn) = self.joined.get(room_id) {
            conn.send(&Frame::new("c.message", json!({ "body": body, "sig": sig })));
        }
    }

    /// Send a local file into a room; relayed inline, never stored anywhere
    /// but the recipients' download directories.
    pub fn send_file(&self, room_id: &str, path: &Path) -> bool {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file unreadable");
                return false;
            }
        };
        if bytes.len() > MAX_FILE_BYTES {
            warn!(path = %path.display(), "file exceeds 50 MiB limit");
            return false;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        if let Some(hosting) = self.hosted.get(room_id) {
            let checksum = sha256_hex(&bytes);
            let file_id = make_token();
            hosting.host.send_to_all(
                &Frame::new(
                    "m.file.begin",
                    json!({
                        "file_id": file_id,
                        "filename": filename,
                        "checksum": checksum,
                        "size": bytes.len(),
                        "sender": self.profile.username(),
                    }),
                )
                .with_room(room_id),
            );
            for chunk in bytes.chunks(P2P_CHUNK_BYTES) {
                hosting.host.send_to_all(
                    &Frame::new(
                        "m.file.chunk",
                        json!({ "file_id": file_id, "data": BASE64.encode(chunk) }),
                    )
                    .with_room(room_id),
                );
            }
            hosting.host.send_to_all(
                &Frame::new(
                    "m.file.end",
                    json!({
                        "file_id": file_id,
                        "filename": filename,
                        "checksum": checksum,
                        "cs_ok": true,
                        "size": bytes.len(),
                        "sender": self.profile.username(),
                    }),
                )
                .with_room(room_id),
            );
            true
        } else if let Some(conn) = self.joined.get(room_id) {
            conn.send_file_bytes(&filename, bytes)
        } else {
            false
        }
    }

    /// Hosted and joined rooms, with role and address metadata.
    pub fn list_rooms(&self) -> Vec<Value> {
        let mut rooms = Vec::new();
        for (room_id, hosting) in &self.hosted {
            rooms.push(json!({
                "room_id": room_id,
                "name": hosting.host.room_name(),
                "role": "host",
                "address": hosting.address,
            }));
        }
        for (room_id, conn) in &self.joined {
            rooms.push(json!({
                "room_id": room_id,
                "name": conn.room_name(),
                "role": "member",
                "host": conn.host_address(),
            }));
        }
        rooms
    }

    /// Known members of a room (`username` + derived id pairs).
    pub fn list_peers(&self, room_id: &str) -> Vec<Value> {
        if let Some(hosting) = self.hosted.get(room_id) {
            return hosting
                .host
                .members()
                .into_iter()
                .map(|(username, did)| json!({ "username": username, "did": did }))
                .collect();
        }
        if let Some(conn) = self.joined.get(room_id) {
            return conn.members();
        }
        Vec::new()
    }
}

impl Drop for P2pNode {
    fn drop(&mut self) {
        self.stop();
    }
}
