//! Per-room host: a WebSocket server bound to localhost, published to the
//! world only through the node's hidden service.
//!
//! Each hosted room runs its own listener and holds its state in memory
//! only, since the P2P transport has no durable store. The host enforces the
//! per-room username rule: one display name maps to one derived identity;
//! the same identity reconnecting evicts its own stale session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use parley_shared::constants::{
    MAX_FILE_BYTES, MAX_FILENAME_LEN, MAX_MESSAGE_LEN, MAX_USERNAME_LEN, P2P_AUTH_TIMEOUT,
    P2P_CHUNK_BYTES, PROTOCOL_VERSION,
};
use parley_shared::crypto::{make_challenge, sha256_hex, verify_room_password};
use parley_shared::protocol::{ClientCommand, JoinRejection, P2pAuthReply};
use parley_shared::rate::RateWindow;
use parley_shared::types::{make_event_id, now_ms, sanitise};
use parley_shared::{ErrorCode, Frame, Realm};

/// Callback receiving every event the host also fans out to its peers, so
/// the hosting user's own UI stays in sync.
pub type EventCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// In-memory room state for a room this node hosts.
#[derive(Debug, Clone)]
pub struct HostedRoom {
    pub room_id: String,
    pub name: String,
    pub creator: String,
    pub password_hash: String,
    pub password_salt: String,
    pub public: bool,
    pub created_at: i64,
    pub topic: String,
    pub host_onion: String,
    /// username → derived public identifier.
    pub members: HashMap<String, String>,
}

impl HostedRoom {
    pub fn display(&self) -> Value {
        json!({
            "room_id": self.room_id,
            "name": self.name,
            "topic": self.topic,
            "creator": self.creator,
            "public": self.public,
            "member_count": self.members.len(),
            "host_onion": self.host_onion,
            "created_at": self.created_at,
        })
    }
}

struct PeerHandle {
    did: String,
    conn_id: u64,
    tx: mpsc::UnboundedSender<String>,
    /// Dropping this (eviction, map removal) makes the connection's read
    /// loop exit and the socket close.
    _kill: tokio::sync::oneshot::Sender<()>,
}

/// A file being relayed through the host.
struct FileRelay {
    filename: String,
    sender: String,
    checksum: String,
    buffer: Vec<u8>,
}

struct HostShared {
    room: Mutex<HostedRoom>,
    peers: Mutex<HashMap<String, PeerHandle>>,
    relays: Mutex<HashMap<String, FileRelay>>,
    host_username: String,
    on_event: EventCallback,
    conn_seq: AtomicU64,
}

impl HostShared {
    fn broadcast(&self, frame: &Frame, exclude: Option<&str>) {
        let raw = frame.to_json();
        for (username, peer) in lock(&self.peers).iter() {
            if exclude == Some(username.as_str()) {
                continue;
            }
            let _ = peer.tx.send(raw.clone());
        }
    }

    fn send_to(&self, username: &str, frame: &Frame) {
        if let Some(peer) = lock(&self.peers).get(username) {
            let _ = peer.tx.send(frame.to_json());
        }
    }

    fn emit(&self, frame: Frame) {
        (self.on_event)(frame);
    }
}

/// WebSocket server for one hosted room.
pub struct RoomHost {
    shared: Arc<HostShared>,
    running: Arc<AtomicBool>,
    bound_port: Arc<AtomicU16>,
    shutdown: Option<watch::Sender<bool>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RoomHost {
    pub fn new(room: HostedRoom, host_username: &str, on_event: EventCallback) -> Self {
        Self {
            shared: Arc::new(HostShared {
                room: Mutex::new(room),
                peers: Mutex::new(HashMap::new()),
                relays: Mutex::new(HashMap::new()),
                host_username: host_username.to_string(),
                on_event,
                conn_seq: AtomicU64::new(0),
            }),
            running: Arc::new(AtomicBool::new(false)),
            bound_port: Arc::new(AtomicU16::new(0)),
            shutdown: None,
            thread: None,
        }
    }

    /// Bind `127.0.0.1:port` (0 for ephemeral) and serve the room.
    pub fn start(&mut self, port: u16) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return true;
        }
        let listener = match std::net::TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "room host bind failed");
                return false;
            }
        };
        if listener.set_nonblocking(true).is_err() {
            return false;
        }
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        self.bound_port.store(bound, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        let shared = self.shared.clone();
        let running = self.running.clone();

        let room_tag = lock(&self.shared.room).room_id.clone();
        let handle = thread::Builder::new()
            .name(format!("p2p-host-{}", &room_tag[1..room_tag.len().min(9)]))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "host runtime build failed");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                runtime.block_on(serve(listener, shared, shutdown_rx));
                running.store(false, Ordering::SeqCst);
            });
        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
                info!(port = bound, "room host online");
                true
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.thread.take();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    pub fn room_display(&self) -> Value {
        lock(&self.shared.room).display()
    }

    pub fn room_id(&self) -> String {
        lock(&self.shared.room).room_id.clone()
    }

    pub fn room_name(&self) -> String {
        lock(&self.shared.room).name.clone()
    }

    /// Connected remote peers (the hosting user is not a connection).
    pub fn peer_count(&self) -> usize {
        lock(&self.shared.peers).len()
    }

    /// Every member, host included, as `(username, derived id)` pairs.
    pub fn members(&self) -> Vec<(String, String)> {
        lock(&self.shared.room)
            .members
            .iter()
            .map(|(u, d)| (u.clone(), d.clone()))
            .collect()
    }

    /// Queue a frame to every connected peer. Safe from any thread.
    pub fn send_to_all(&self, frame: &Frame) {
        self.shared.broadcast(frame, None);
    }
}

impl Drop for RoomHost {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn serve(
    listener: std::net::TcpListener,
    shared: Arc<HostShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "host listener registration failed");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        tokio::spawn(handle_peer(shared.clone(), stream));
                    }
                    Err(e) => warn!(error = %e, "host accept failed"),
                }
            }
        }
    }
    debug!("room host loop terminated");
}

async fn handle_peer(shared: Arc<HostShared>, stream: TcpStream) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "peer upgrade failed");
            return;
        }
    };
    let (mut sink, mut reader) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if sink.send(Message::Text(raw)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let conn_id = shared.conn_seq.fetch_add(1, Ordering::SeqCst);
    let (kill_tx, kill_rx) = tokio::sync::oneshot::channel::<()>();
    if let Some((username, did)) = admit_peer(&shared, &tx, &mut reader, conn_id, kill_tx).await {
        peer_loop(&shared, &username, &mut reader, kill_rx).await;
        depart_peer(&shared, &username, &did, conn_id);
    }

    drop(tx);
    let _ = writer.await;
}

/// Challenge/response admission. Returns the registered `(username, did)`
/// on success; rejections have already been queued as `m.auth.fail`.
async fn admit_peer(
    shared: &Arc<HostShared>,
    tx: &mpsc::UnboundedSender<String>,
    reader: &mut futures::stream::SplitStream<WebSocketStream<TcpStream>>,
    conn_id: u64,
    kill_tx: tokio::sync::oneshot::Sender<()>,
) -> Option<(String, String)> {
    let (room_id, room_name, password_hash, password_salt) = {
        let room = lock(&shared.room);
        (
            room.room_id.clone(),
            room.name.clone(),
            room.password_hash.clone(),
            room.password_salt.clone(),
        )
    };

    let challenge = make_challenge();
    let challenge_frame = Frame::new(
        "s.challenge",
        json!({
            "challenge": BASE64.encode(challenge),
            "room_name": room_name,
            "proto": PROTOCOL_VERSION,
        }),
    )
    .with_room(&room_id);
    tx.send(challenge_frame.to_json()).ok()?;

    let fail = |reason: JoinRejection, hint: Option<&str>| {
        let mut content = json!({ "reason": reason.as_str() });
        if let Some(hint) = hint {
            content["hint"] = json!(hint);
        }
        let _ = tx.send(Frame::new("m.auth.fail", content).to_json());
    };

    let raw = match timeout(P2P_AUTH_TIMEOUT, next_text(reader)).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(_) => {
            fail(JoinRejection::Timeout, None);
            return None;
        }
    };
    let auth: Option<P2pAuthReply> = Frame::parse(&raw).and_then(|frame| {
        if frame.kind != "c.auth" {
            return None;
        }
        serde_json::from_value(frame.content).ok()
    });
    let Some(auth) = auth else {
        fail(JoinRejection::BadType, None);
        return None;
    };

    let username = sanitise(&auth.username, MAX_USERNAME_LEN);
    let did = sanitise(&auth.did, 80);
    if username.is_empty() {
        fail(JoinRejection::NoUsername, None);
        return None;
    }

    // One display name per derived identity; the same identity
    // reconnecting evicts its own stale session.
    {
        let mut peers = lock(&shared.peers);
        if let Some(existing) = peers.get(&username) {
            if existing.did != did {
                fail(
                    JoinRejection::UsernameTaken,
                    Some("choose a different username"),
                );
                return None;
            }
            debug!(username = %username, "evicting stale session for reconnect");
            peers.remove(&username);
        }
    }

    if !password_hash.is_empty()
        && !verify_room_password(&auth.room_password, &password_salt, &password_hash)
    {
        fail(JoinRejection::WrongPassword, None);
        return None;
    }

    let members: Vec<Value> = {
        let mut room = lock(&shared.room);
        room.members.insert(username.clone(), did.clone());
        room.members
            .iter()
            .map(|(u, d)| json!({ "username": u, "did": d }))
            .collect()
    };
    lock(&shared.peers).insert(
        username.clone(),
        PeerHandle {
            did: did.clone(),
            conn_id,
            tx: tx.clone(),
            _kill: kill_tx,
        },
    );

    let topic = lock(&shared.room).topic.clone();
    let ok = Frame::new(
        "m.auth.ok",
        json!({
            "host": shared.host_username,
            "members": members,
            "topic": topic,
        }),
    )
    .with_room(&room_id);
    let _ = tx.send(ok.to_json());

    let join_event = Frame::new(
        "m.member.join",
        json!({ "username": username, "did": did, "ts": now_ms() }),
    )
    .with_room(&room_id);
    shared.broadcast(&join_event, Some(username.as_str()));
    shared.emit(join_event);

    info!(username = %username, "peer joined hosted room");
    Some((username, did))
}

/// Remove a departing peer, unless a reconnect already replaced its entry.
fn depart_peer(shared: &Arc<HostShared>, username: &str, did: &str, conn_id: u64) {
    {
        let mut peers = lock(&shared.peers);
        match peers.get(username) {
            Some(existing) if existing.conn_id == conn_id => {
                peers.remove(username);
            }
            _ => return,
        }
    }
    lock(&shared.room).members.remove(username);
    lock(&shared.relays).retain(|_, relay| relay.sender != username);

    let room_id = lock(&shared.room).room_id.clone();
    let leave_event = Frame::new(
        "m.member.leave",
        json!({ "username": username, "did": did, "ts": now_ms() }),
    )
    .with_room(&room_id);
    shared.broadcast(&leave_event, None);
    shared.emit(leave_event);
    info!(username = %username, "peer left hosted room");
}

async fn peer_loop(
    shared: &Arc<HostShared>,
    username: &str,
    reader: &mut futures::stream::SplitStream<WebSocketStream<TcpStream>>,
    mut kill_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let room_id = lock(&shared.room).room_id.clone();
    let mut rate = RateWindow::new();

    loop {
        let message = tokio::select! {
            // Fires when this session's handle is dropped (eviction).
            _ = &mut kill_rx => break,
            message = reader.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Some(frame) = Frame::parse(&text) else {
            debug!("dropping malformed frame");
            continue;
        };
        let Some(command) = ClientCommand::decode(&frame) else {
            debug!(kind = %frame.kind, "dropping unknown frame");
            continue;
        };
        // The sliding window guards chat traffic; file chunks are bounded
        // by their own size ceilings instead.
        if matches!(command, ClientCommand::Message { .. }) && !rate.allow(Instant::now()) {
            shared.send_to(
                username,
                &Frame::error(ErrorCode::RateLimited, "Slow down."),
            );
            continue;
        }

        match command {
            ClientCommand::Ping => shared.send_to(username, &Frame::pong()),

            ClientCommand::Message { body, sig } => {
                let body = sanitise(&body, MAX_MESSAGE_LEN);
                if body.is_empty() {
                    continue;
                }
                let did = lock(&shared.peers)
                    .get(username)
                    .map(|p| p.did.clone())
                    .unwrap_or_default();
                let mut event = Frame::new(
                    "m.room.message",
                    json!({
                        "body": body,
                        "msgtype": "m.text",
                        "did": did,
                        "sig": sig,
                    }),
                )
                .with_room(&room_id);
                event.event_id = Some(make_event_id(Realm::P2p));
                event.sender = Some(username.to_string());
                event.timestamp = Some(now_ms());

                shared.broadcast(&event, None);
                shared.emit(event);
            }

            ClientCommand::FileBegin(req) => {
                if req.size as usize > MAX_FILE_BYTES {
                    shared.send_to(
                        username,
                        &Frame::error(ErrorCode::TooLarge, "File exceeds 50 MiB limit."),
                    );
                    continue;
                }
                let file_id = parley_shared::types::make_token();
                let filename = sanitise(
                    std::path::Path::new(&req.filename)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("file"),
                    MAX_FILENAME_LEN,
                );
                lock(&shared.relays).insert(
                    file_id.clone(),
                    FileRelay {
                        filename: filename.clone(),
                        sender: username.to_string(),
                        checksum: req.checksum.to_lowercase(),
                        buffer: Vec::new(),
                    },
                );
                // The relay begins for the other members right away; the
                // hosting user only sees the end-of-transfer summary.
                let begin = Frame::new(
                    "m.file.begin",
                    json!({
                        "file_id": file_id,
                        "filename": filename,
                        "checksum": req.checksum,
                        "size": req.size,
                        "sender": username,
                    }),
                )
                .with_room(&room_id);
                shared.broadcast(&begin, Some(username));
                shared.send_to(
                    username,
                    &Frame::new("m.file.ready", json!({ "file_id": file_id })),
                );
            }

            ClientCommand::FileChunk(req) => {
                let file_id = req.stream_id().to_string();
                let Ok(data) = BASE64.decode(&req.data) else {
                    lock(&shared.relays).remove(&file_id);
                    continue;
                };
                let verdict = {
                    let mut relays = lock(&shared.relays);
                    match relays.get_mut(&file_id) {
                        Some(relay) if relay.sender == username => {
                            if data.len() > P2P_CHUNK_BYTES {
                                relays.remove(&file_id);
                                Some(ErrorCode::FileError)
                            } else if relay.buffer.len() + data.len() > MAX_FILE_BYTES {
                                relays.remove(&file_id);
                                Some(ErrorCode::TooLarge)
                            } else {
                                relay.buffer.extend_from_slice(&data);
                                None
                            }
                        }
                        _ => continue,
                    }
                };
                match verdict {
                    Some(code) => {
                        shared.send_to(username, &Frame::error(code, "Transfer aborted."));
                    }
                    None => {
                        let chunk = Frame::new(
                            "m.file.chunk",
                            json!({ "file_id": file_id, "data": req.data }),
                        )
                        .with_room(&room_id);
                        shared.broadcast(&chunk, Some(username));
                    }
                }
            }

            ClientCommand::FileEnd { stream_id } => {
                let relay = {
                    let mut relays = lock(&shared.relays);
                    match relays.get(&stream_id) {
                        Some(relay) if relay.sender == username => {
                            relays.remove(&stream_id)
                        }
                        _ => None,
                    }
                };
                let Some(relay) = relay else {
                    continue;
                };
                let checksum_ok =
                    relay.checksum.is_empty() || sha256_hex(&relay.buffer) == relay.checksum;
                let end = Frame::new(
                    "m.file.end",
                    json!({
                        "file_id": stream_id,
                        "filename": relay.filename,
                        "checksum": relay.checksum,
                        "cs_ok": checksum_ok,
                        "size": relay.buffer.len(),
                        "sender": relay.sender,
                    }),
                )
                .with_room(&room_id);
                shared.broadcast(&end, Some(username));
                shared.emit(end);
            }

            ClientCommand::RoomLeave => break,

            // The host serves exactly one room; registry and store
            // commands belong to the LAN transport.
            _ => debug!(user = %username, "dropping unsupported command"),
        }
    }
}

async fn next_text(
    reader: &mut futures::stream::SplitStream<WebSocketStream<TcpStream>>,
) -> Option<String> {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}
