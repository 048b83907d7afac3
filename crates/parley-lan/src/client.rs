//! WebSocket LAN chat client.
//!
//! The client owns its own worker thread and runtime; the embedder talks to
//! it through non-blocking enqueue methods and receives every inbound event
//! through a callback. File chunk frames are assembled internally and
//! surfaced as a single synthetic `m.file.received` event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use parley_shared::constants::{
    KEEPALIVE_INTERVAL, LAN_AUTH_TIMEOUT, LAN_CHUNK_BYTES, MAX_FILE_BYTES, MAX_MESSAGE_LEN,
};
use parley_shared::crypto::{sha256_hex, sign_challenge};
use parley_shared::types::sanitise;
use parley_shared::Frame;

use crate::config::LanClientConfig;

/// Callback receiving every inbound event, called from the client's own
/// thread; marshal onto a UI thread before touching widgets.
pub type EventCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// A file currently being received.
struct RxTransfer {
    filename: String,
    checksum: String,
    buffer: Vec<u8>,
}

struct ClientShared {
    config: LanClientConfig,
    connected: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    handle: Mutex<Option<tokio::runtime::Handle>>,
    pending_ready: Mutex<Option<oneshot::Sender<String>>>,
    rx_transfers: Mutex<HashMap<String, RxTransfer>>,
    on_event: EventCallback,
}

/// Connects to a [`crate::LanServer`].
pub struct LanClient {
    inner: Arc<ClientShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LanClient {
    pub fn new(config: LanClientConfig, on_event: EventCallback) -> Self {
        Self {
            inner: Arc::new(ClientShared {
                config,
                connected: AtomicBool::new(false),
                tx: Mutex::new(None),
                handle: Mutex::new(None),
                pending_ready: Mutex::new(None),
                rx_transfers: Mutex::new(HashMap::new()),
                on_event,
            }),
            thread: None,
        }
    }

    /// Connect and authenticate synchronously (blocks up to ~12 s).
    /// Returns `true` on success.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        if self.is_connected() {
            return true;
        }
        let (result_tx, result_rx) = std_mpsc::channel::<bool>();
        let inner = self.inner.clone();
        let url = format!("ws://{host}:{port}");

        let handle = thread::Builder::new()
            .name("lan-client".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(error = %e, "client runtime build failed");
                        let _ = result_tx.send(false);
                        return;
                    }
                };
                runtime.block_on(run_client(inner, url, result_tx));
            });
        match handle {
            Ok(handle) => self.thread = Some(handle),
            Err(_) => return false,
        }

        result_rx
            .recv_timeout(Duration::from_secs(12))
            .unwrap_or(false)
    }

    pub fn disconnect(&mut self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        // Dropping the sender unblocks the send loop, which closes the
        // socket and lets the read loop exit.
        lock(&self.inner.tx).take();
        self.thread.take();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    // -- Enqueue helpers ----------------------------------------------------

    fn enqueue(&self, frame: Frame) {
        if !self.is_connected() {
            return;
        }
        if let Some(tx) = lock(&self.inner.tx).as_ref() {
            let _ = tx.send(frame.to_json());
        }
    }

    pub fn send_message(&self, room_id: &str, text: &str) {
        self.enqueue(
            Frame::new(
                "c.message",
                json!({ "body": sanitise(text, MAX_MESSAGE_LEN) }),
            )
            .with_room(room_id),
        );
    }

    pub fn create_room(&self, name: &str, password: &str, public: bool, topic: &str) {
        self.enqueue(Frame::new(
            "c.room.create",
            json!({ "name": name, "password": password, "public": public, "topic": topic }),
        ));
    }

    pub fn join_room(&self, room_id: &str, password: &str) {
        self.enqueue(Frame::new(
            "c.room.join",
            json!({ "room_id": room_id, "password": password }),
        ));
    }

    pub fn leave_room(&self, room_id: &str) {
        self.enqueue(Frame::new("c.room.leave", json!({})).with_room(room_id));
    }

    pub fn list_rooms(&self) {
        self.enqueue(Frame::new("c.room.list", json!({})));
    }

    pub fn list_files(&self, room_id: &str) {
        self.enqueue(Frame::new("c.room.files", json!({})).with_room(room_id));
    }

    pub fn request_history(&self, room_id: &str, limit: u32) {
        self.enqueue(Frame::new("c.room.history", json!({ "limit": limit })).with_room(room_id));
    }

    /// Request a stored file; it arrives through the normal chunk assembly
    /// and is surfaced as `m.file.received`.
    pub fn download_file(&self, room_id: &str, file_id: &str) {
        self.enqueue(Frame::new("c.file.get", json!({ "file_id": file_id })).with_room(room_id));
    }

    /// Send a local file to a room. Returns `false` if the client is not
    /// connected or the file cannot be read; the transfer itself proceeds
    /// asynchronously.
    pub fn send_file(&self, room_id: &str, path: &Path) -> bool {
        if !self.is_connected() {
            return false;
        }
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file unreadable");
                return false;
            }
        };
        if bytes.len() > MAX_FILE_BYTES {
            warn!(path = %path.display(), size = bytes.len(), "file exceeds 50 MiB limit");
            return false;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file.txt")
            .to_string();
        let Some(handle) = lock(&self.inner.handle).clone() else {
            return false;
        };

        let inner = self.inner.clone();
        let room_id = room_id.to_string();
        handle.spawn(async move {
            upload(inner, room_id, filename, bytes).await;
        });
        true
    }
}

impl Drop for LanClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_client(inner: Arc<ClientShared>, url: String, result_tx: std_mpsc::Sender<bool>) {
    let connect = timeout(Duration::from_secs(8), connect_async(url.as_str())).await;
    let ws = match connect {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(url = %url, error = %e, "connect failed");
            let _ = result_tx.send(false);
            return;
        }
        Err(_) => {
            warn!(url = %url, "connect timed out");
            let _ = result_tx.send(false);
            return;
        }
    };
    let (mut sink, mut reader) = ws.split();

    // -- Handshake ----------------------------------------------------------
    let challenge_hex = match timeout(LAN_AUTH_TIMEOUT, next_text(&mut reader)).await {
        Ok(Some(raw)) => match Frame::parse(&raw) {
            Some(frame) if frame.kind == "m.auth.challenge" => frame.content["challenge"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            _ => {
                let _ = result_tx.send(false);
                return;
            }
        },
        _ => {
            let _ = result_tx.send(false);
            return;
        }
    };
    let Ok(challenge) = hex::decode(&challenge_hex) else {
        let _ = result_tx.send(false);
        return;
    };
    let response = sign_challenge(inner.config.token.as_bytes(), &challenge);
    let auth = Frame::new(
        "c.auth",
        json!({ "username": inner.config.username, "response": response }),
    );
    if sink.send(Message::Text(auth.to_json())).await.is_err() {
        let _ = result_tx.send(false);
        return;
    }

    match timeout(LAN_AUTH_TIMEOUT, next_text(&mut reader)).await {
        Ok(Some(raw)) => match Frame::parse(&raw) {
            Some(frame) if frame.kind == "m.auth.ok" => {}
            Some(frame) => {
                warn!(reply = %frame.kind, code = %frame.content["code"], "auth rejected");
                let _ = result_tx.send(false);
                return;
            }
            None => {
                let _ = result_tx.send(false);
                return;
            }
        },
        _ => {
            let _ = result_tx.send(false);
            return;
        }
    }

    // -- Connected ----------------------------------------------------------
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *lock(&inner.tx) = Some(tx);
    *lock(&inner.handle) = Some(tokio::runtime::Handle::current());
    inner.connected.store(true, Ordering::SeqCst);
    let _ = result_tx.send(true);
    info!(url = %url, username = %inner.config.username, "connected");

    let send_inner = inner.clone();
    let send_loop = async move {
        loop {
            match timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
                Ok(Some(raw)) => {
                    if sink.send(Message::Text(raw)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_idle) => {
                    // Keep-alive so the server-side read never starves.
                    if !send_inner.connected.load(Ordering::SeqCst) {
                        break;
                    }
                    let ping = Frame::new("c.ping", serde_json::Value::Null).to_json();
                    if sink.send(Message::Text(ping)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    };

    let recv_inner = inner.clone();
    let recv_loop = async move {
        while let Some(raw) = next_text(&mut reader).await {
            if let Some(frame) = Frame::parse(&raw) {
                handle_inbound(&recv_inner, frame);
            }
        }
    };

    futures::future::join(send_loop, recv_loop).await;

    inner.connected.store(false, Ordering::SeqCst);
    lock(&inner.tx).take();
    (inner.on_event)(Frame::new("m.client.disconnected", json!({})));
    info!("disconnected");
}

/// Route one inbound frame: intercept transfer plumbing, forward the rest.
fn handle_inbound(inner: &Arc<ClientShared>, frame: Frame) {
    match frame.kind.as_str() {
        "m.file.ready" => {
            if let Some(waiter) = lock(&inner.pending_ready).take() {
                let transfer_id = frame.content["transfer_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let _ = waiter.send(transfer_id);
                return;
            }
            (inner.on_event)(frame);
        }
        "m.file.begin" => {
            let file_id = frame.content["file_id"].as_str().unwrap_or_default();
            let filename = sanitise(
                Path::new(frame.content["filename"].as_str().unwrap_or("file"))
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("file"),
                parley_shared::constants::MAX_FILENAME_LEN,
            );
            lock(&inner.rx_transfers).insert(
                file_id.to_string(),
                RxTransfer {
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
            let mut transfers = lock(&inner.rx_transfers);
            if let Some(transfer) = transfers.get_mut(file_id) {
                if transfer.buffer.len() + data.len() > MAX_FILE_BYTES {
                    debug!(file_id = %file_id, "incoming file over ceiling, dropping");
                    transfers.remove(file_id);
                    return;
                }
                transfer.buffer.extend_from_slice(&data);
            }
        }
        "m.file.end" => {
            let file_id = frame.content["file_id"].as_str().unwrap_or_default();
            let Some(transfer) = lock(&inner.rx_transfers).remove(file_id) else {
                return;
            };
            let checksum = sha256_hex(&transfer.buffer);
            let dest = inner.config.download_dir.join(&transfer.filename);
            if let Err(e) = std::fs::create_dir_all(&inner.config.download_dir)
                .and_then(|_| std::fs::write(&dest, &transfer.buffer))
            {
                warn!(error = %e, "could not write received file");
                return;
            }
            (inner.on_event)(Frame::new(
                "m.file.received",
                json!({
                    "file_id": file_id,
                    "filename": transfer.filename,
                    "size": transfer.buffer.len(),
                    "checksum": checksum,
                    "checksum_ok": transfer.checksum.is_empty()
                        || transfer.checksum == checksum,
                    "path": dest.to_string_lossy(),
                }),
            ));
        }
        _ => (inner.on_event)(frame),
    }
}

/// Push one file up in 64 KiB chunks after waiting for the server-assigned
/// transfer id.
async fn upload(inner: Arc<ClientShared>, room_id: String, filename: String, bytes: Vec<u8>) {
    let checksum = sha256_hex(&bytes);
    let (ready_tx, ready_rx) = oneshot::channel();
    *lock(&inner.pending_ready) = Some(ready_tx);

    let begin = Frame::new(
        "c.file.begin",
        json!({ "filename": filename, "size": bytes.len(), "checksum": checksum }),
    )
    .with_room(&room_id);
    if let Some(tx) = lock(&inner.tx).as_ref() {
        let _ = tx.send(begin.to_json());
    }

    let transfer_id = match timeout(Duration::from_secs(10), ready_rx).await {
        Ok(Ok(id)) if !id.is_empty() => id,
        _ => {
            lock(&inner.pending_ready).take();
            warn!("server did not acknowledge file begin");
            return;
        }
    };

    let Some(tx) = lock(&inner.tx).as_ref().cloned() else {
        return;
    };
    for chunk in bytes.chunks(LAN_CHUNK_BYTES) {
        let frame = Frame::new(
            "c.file.chunk",
            json!({ "transfer_id": transfer_id, "data": BASE64.encode(chunk) }),
        )
        .with_room(&room_id);
        if tx.send(frame.to_json()).is_err() {
            return;
        }
    }
    let end = Frame::new("c.file.end", json!({ "transfer_id": transfer_id })).with_room(&room_id);
    let _ = tx.send(end.to_json());
    info!(filename = %filename, size = bytes.len(), "file sent");
}

async fn next_text(
    reader: &mut futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner(dir: &Path) -> (Arc<ClientShared>, Arc<Mutex<Vec<Frame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let inner = Arc::new(ClientShared {
            config: LanClientConfig::new("alice", "tok", dir.to_path_buf()),
            connected: AtomicBool::new(true),
            tx: Mutex::new(None),
            handle: Mutex::new(None),
            pending_ready: Mutex::new(None),
            rx_transfers: Mutex::new(HashMap::new()),
            on_event: Arc::new(move |frame| sink.lock().unwrap().push(frame)),
        });
        (inner, seen)
    }

    #[test]
    fn chunked_download_is_reassembled() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, seen) = test_inner(dir.path());
        let payload = b"reassemble me".to_vec();
        let checksum = sha256_hex(&payload);

        handle_inbound(
            &inner,
            Frame::new(
                "m.file.begin",
                json!({ "file_id": "f1", "filename": "out.txt", "checksum": checksum, "size": payload.len() }),
            ),
        );
        for chunk in payload.chunks(4) {
            handle_inbound(
                &inner,
                Frame::new(
                    "m.file.chunk",
                    json!({ "file_id": "f1", "data": BASE64.encode(chunk) }),
                ),
            );
        }
        handle_inbound(
            &inner,
            Frame::new("m.file.end", json!({ "file_id": "f1" })),
        );

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        let received = &events[0];
        assert_eq!(received.kind, "m.file.received");
        assert_eq!(received.content["checksum"], checksum);
        assert_eq!(received.content["checksum_ok"], true);
        assert_eq!(
            std::fs::read(dir.path().join("out.txt")).unwrap(),
            payload
        );
    }

    #[test]
    fn download_filename_cannot_escape_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, seen) = test_inner(dir.path());

        handle_inbound(
            &inner,
            Frame::new(
                "m.file.begin",
                json!({ "file_id": "f2", "filename": "../../evil.sh", "checksum": "", "size": 1 }),
            ),
        );
        handle_inbound(
            &inner,
            Frame::new(
                "m.file.chunk",
                json!({ "file_id": "f2", "data": BASE64.encode(b"x") }),
            ),
        );
        handle_inbound(
            &inner,
            Frame::new("m.file.end", json!({ "file_id": "f2" })),
        );

        let events = seen.lock().unwrap();
        assert_eq!(events[0].content["filename"], "evil.sh");
        assert!(dir.path().join("evil.sh").exists());
    }

    #[test]
    fn chat_events_pass_straight_through() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, seen) = test_inner(dir.path());
        handle_inbound(
            &inner,
            Frame::new("m.room.message", json!({ "body": "hi" })).with_room("!r:lan"),
        );
        assert_eq!(seen.lock().unwrap()[0].kind, "m.room.message");
    }

    #[test]
    fn pending_upload_intercepts_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, seen) = test_inner(dir.path());
        let (ready_tx, mut ready_rx) = oneshot::channel();
        *lock(&inner.pending_ready) = Some(ready_tx);

        handle_inbound(
            &inner,
            Frame::new("m.file.ready", json!({ "transfer_id": "t9" })),
        );

        assert_eq!(ready_rx.try_recv().unwrap(), "t9");
        assert!(seen.lock().unwrap().is_empty());
    }
}
