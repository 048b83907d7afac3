//! Outbound connection to a hosted room.
//!
//! Join addresses look like `<rendezvous>.onion/<room_id>`; `.onion` hosts
//! are dialed through the local SOCKS5 proxy, anything else connects
//! directly (loopback peers, tests). The connection runs its own worker
//! thread and delivers every inbound frame to a callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, connect_async};
use tracing::{info, warn};

use parley_shared::constants::{
    HIDDEN_SERVICE_BASE_PORT, KEEPALIVE_INTERVAL, MAX_FILE_BYTES, P2P_AUTH_TIMEOUT,
    P2P_CHUNK_BYTES,
};
use parley_shared::crypto::sha256_hex;
use parley_shared::protocol::P2pAuthReply;
use parley_shared::Frame;

use crate::error::{P2pError, Result};
use crate::host::EventCallback;
use crate::tor::socks5_connect;

/// Parsed `<host>[:port]/<room_id>` join address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomAddress {
    pub host: String,
    pub port: u16,
    pub room_id: String,
}

impl RoomAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let (hostport, room_id) = raw
            .split_once('/')
            .ok_or_else(|| P2pError::AddressParse(format!("expected <host>/<room_id>: {raw}")))?;
        if room_id.is_empty() {
            return Err(P2pError::AddressParse("missing room id".to_string()));
        }
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| P2pError::AddressParse(format!("bad port: {port}")))?,
            ),
            None => (hostport.to_string(), HIDDEN_SERVICE_BASE_PORT),
        };
        if host.is_empty() {
            return Err(P2pError::AddressParse("missing host".to_string()));
        }
        Ok(Self {
            host,
            port,
            room_id: room_id.to_string(),
        })
    }

    pub fn via_tor(&self) -> bool {
        self.host.ends_with(".onion")
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// What the joining peer presents during the handshake.
#[derive(Debug, Clone)]
pub struct JoinCredentials {
    pub username: String,
    pub did: String,
    pub session_pubkey: String,
    pub auth_token: String,
    pub room_password: String,
}

struct ConnShared {
    connected: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    handle: Mutex<Option<tokio::runtime::Handle>>,
    pending_ready: Mutex<Option<oneshot::Sender<String>>>,
    room_name: Mutex<String>,
    members: Mutex<Vec<Value>>,
    on_event: EventCallback,
}

/// One joined room on a remote host.
pub struct RoomConnection {
    inner: Arc<ConnShared>,
    address: RoomAddress,
    thread: Option<thread::JoinHandle<()>>,
}

impl RoomConnection {
    /// Dial, handshake and start the event loops. Blocks until the host
    /// accepts or rejects the join (Tor circuits can take a while).
    pub fn connect(
        address: RoomAddress,
        credentials: JoinCredentials,
        on_event: EventCallback,
    ) -> Result<Self> {
        let inner = Arc::new(ConnShared {
            connected: AtomicBool::new(false),
            tx: Mutex::new(None),
            handle: Mutex::new(None),
            pending_ready: Mutex::new(None),
            room_name: Mutex::new(address.room_id.clone()),
            members: Mutex::new(Vec::new()),
            on_event,
        });

        let (result_tx, result_rx) = std_mpsc::channel::<Result<()>>();
        let run_inner = inner.clone();
        let run_address = address.clone();

        let handle = thread::Builder::new()
            .name(format!(
                "p2p-client-{}",
                &address.room_id[1..address.room_id.len().min(9)]
            ))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = result_tx.send(Err(P2pError::Io(e)));
                        return;
                    }
                };
                runtime.block_on(run_connection(
                    run_inner,
                    run_address,
                    credentials,
                    result_tx,
                ));
            })
            .map_err(P2pError::Io)?;

        let result = result_rx
            .recv_timeout(Duration::from_secs(90))
            .unwrap_or_else(|_| Err(P2pError::Handshake("join timed out".to_string())));
        match result {
            Ok(()) => Ok(Self {
                inner,
                address,
                thread: Some(handle),
            }),
            Err(e) => Err(e),
        }
    }

    pub fn disconnect(&mut self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        lock(&self.inner.tx).take();
        self.thread.take();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn room_id(&self) -> &str {
        &self.address.room_id
    }

    pub fn room_name(&self) -> String {
        lock(&self.inner.room_name).clone()
    }

    pub fn host_address(&self) -> String {
        format!("{}:{}", self.address.host, self.address.port)
    }

    /// Membership snapshot from the join handshake.
    pub fn members(&self) -> Vec<Value> {
        lock(&self.inner.members).clone()
    }

    pub fn send(&self, frame: &Frame) {
        if !self.is_connected() {
            return;
        }
        if let Some(tx) = lock(&self.inner.tx).as_ref() {
            let _ = tx.send(frame.to_json());
        }
    }

    /// Push a file to the host for inline relay. Proceeds asynchronously;
    /// returns `false` when not connected or the payload is over the cap.
    pub fn send_file_bytes(&self, filename: &str, bytes: Vec<u8>) -> bool {
        if !self.is_connected() || bytes.len() > MAX_FILE_BYTES {
            return false;
        }
        let Some(handle) = lock(&self.inner.handle).clone() else {
            return false;
        };
        let inner = self.inner.clone();
        let filename = filename.to_string();
        handle.spawn(async move {
            upload(inner, filename, bytes).await;
        });
        true
    }
}

impl std::fmt::Debug for RoomConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Drop for RoomConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_connection(
    inner: Arc<ConnShared>,
    address: RoomAddress,
    credentials: JoinCredentials,
    result_tx: std_mpsc::Sender<Result<()>>,
) {
    // -- Dial ---------------------------------------------------------------
    let ws = if address.via_tor() {
        let stream = match socks5_connect(&address.host, address.port).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = result_tx.send(Err(e));
                return;
            }
        };
        match client_async(address.url().as_str(), stream).await {
            Ok((ws, _)) => WsEither::Plain(ws),
            Err(e) => {
                let _ = result_tx.send(Err(e.into()));
                return;
            }
        }
    } else {
        match timeout(Duration::from_secs(10), connect_async(address.url().as_str())).await {
            Ok(Ok((ws, _))) => WsEither::Tls(ws),
            Ok(Err(e)) => {
                let _ = result_tx.send(Err(e.into()));
                return;
            }
            Err(_) => {
                let _ = result_tx.send(Err(P2pError::Handshake("connect timed out".to_string())));
                return;
            }
        }
    };
    let (mut sink, mut reader) = ws.split();

    // -- Handshake ----------------------------------------------------------
    let challenge = match timeout(P2P_AUTH_TIMEOUT, reader.next_text()).await {
        Ok(Some(raw)) => Frame::parse(&raw),
        _ => None,
    };
    let Some(challenge) = challenge.filter(|f| f.kind == "s.challenge") else {
        let _ = result_tx.send(Err(P2pError::Handshake(
            "host did not send a challenge".to_string(),
        )));
        return;
    };
    if let Some(name) = challenge.content["room_name"].as_str() {
        *lock(&inner.room_name) = name.to_string();
    }

    let reply = P2pAuthReply {
        username: credentials.username.clone(),
        did: credentials.did.clone(),
        session_pubkey: credentials.session_pubkey.clone(),
        auth_token: credentials.auth_token.clone(),
        room_password: credentials.room_password.clone(),
    };
    let auth = Frame::new(
        "c.auth",
        serde_json::to_value(&reply).unwrap_or_default(),
    );
    if sink.send(Message::Text(auth.to_json())).await.is_err() {
        let _ = result_tx.send(Err(P2pError::Handshake("send failed".to_string())));
        return;
    }

    let verdict = match timeout(P2P_AUTH_TIMEOUT, reader.next_text()).await {
        Ok(Some(raw)) => Frame::parse(&raw),
        _ => None,
    };
    match verdict {
        Some(frame) if frame.kind == "m.auth.ok" => {
            if let Some(members) = frame.content["members"].as_array() {
                *lock(&inner.members) = members.clone();
            }
        }
        Some(frame) if frame.kind == "m.auth.fail" => {
            let reason = frame.content["reason"].as_str().unwrap_or("rejected");
            let hint = frame.content["hint"].as_str().unwrap_or_default();
            let detail = if hint.is_empty() {
                reason.to_string()
            } else {
                format!("{reason} ({hint})")
            };
            let _ = result_tx.send(Err(P2pError::Rejected(detail)));
            return;
        }
        _ => {
            let _ = result_tx.send(Err(P2pError::Handshake(
                "host closed during handshake".to_string(),
            )));
            return;
        }
    }

    // -- Connected ----------------------------------------------------------
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *lock(&inner.tx) = Some(tx);
    *lock(&inner.handle) = Some(tokio::runtime::Handle::current());
    inner.connected.store(true, Ordering::SeqCst);
    let _ = result_tx.send(Ok(()));
    info!(room = %lock(&inner.room_name), "joined hosted room");

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
        while let Some(raw) = reader.next_text().await {
            let Some(frame) = Frame::parse(&raw) else {
                continue;
            };
            if frame.kind == "m.file.ready" {
                if let Some(waiter) = lock(&recv_inner.pending_ready).take() {
                    let file_id = frame.content["file_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    let _ = waiter.send(file_id);
                    continue;
                }
            }
            (recv_inner.on_event)(frame);
        }
    };

    futures::future::join(send_loop, recv_loop).await;

    inner.connected.store(false, Ordering::SeqCst);
    lock(&inner.tx).take();
    (inner.on_event)(Frame::new("m.client.disconnected", json!({})));
    info!("left hosted room");
}

async fn upload(inner: Arc<ConnShared>, filename: String, bytes: Vec<u8>) {
    let checksum = sha256_hex(&bytes);
    let (ready_tx, ready_rx) = oneshot::channel();
    *lock(&inner.pending_ready) = Some(ready_tx);

    let begin = Frame::new(
        "c.file.begin",
        json!({ "filename": filename, "checksum": checksum, "size": bytes.len() }),
    );
    if let Some(tx) = lock(&inner.tx).as_ref() {
        let _ = tx.send(begin.to_json());
    }

    let file_id = match timeout(Duration::from_secs(10), ready_rx).await {
        Ok(Ok(id)) if !id.is_empty() => id,
        _ => {
            lock(&inner.pending_ready).take();
            warn!("host did not acknowledge file begin");
            return;
        }
    };

    let Some(tx) = lock(&inner.tx).as_ref().cloned() else {
        return;
    };
    for chunk in bytes.chunks(P2P_CHUNK_BYTES) {
        let frame = Frame::new(
            "c.file.chunk",
            json!({ "file_id": file_id, "data": BASE64.encode(chunk) }),
        );
        if tx.send(frame.to_json()).is_err() {
            return;
        }
    }
    let _ = tx.send(Frame::new("c.file.end", json!({ "file_id": file_id })).to_json());
    info!(filename = %filename, size = bytes.len(), "file sent for relay");
}

// ---------------------------------------------------------------------------
// The two stream flavors (direct connect_async vs SOCKS-wrapped client_async)
// have different concrete types; this tiny enum lets one code path own both.
// ---------------------------------------------------------------------------

use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

enum WsEither {
    Plain(WebSocketStream<tokio::net::TcpStream>),
    Tls(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>),
}

enum SinkEither {
    Plain(futures::stream::SplitSink<WebSocketStream<tokio::net::TcpStream>, Message>),
    Tls(
        futures::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
            Message,
        >,
    ),
}

enum ReaderEither {
    Plain(futures::stream::SplitStream<WebSocketStream<tokio::net::TcpStream>>),
    Tls(futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>),
}

impl WsEither {
    fn split(self) -> (SinkEither, ReaderEither) {
        match self {
            WsEither::Plain(ws) => {
                let (sink, reader) = ws.split();
                (SinkEither::Plain(sink), ReaderEither::Plain(reader))
            }
            WsEither::Tls(ws) => {
                let (sink, reader) = ws.split();
                (SinkEither::Tls(sink), ReaderEither::Tls(reader))
            }
        }
    }
}

impl SinkEither {
    async fn send(&mut self, message: Message) -> std::result::Result<(), ()> {
        let result = match self {
            SinkEither::Plain(sink) => sink.send(message).await.map_err(|_| ()),
            SinkEither::Tls(sink) => sink.send(message).await.map_err(|_| ()),
        };
        result
    }

    async fn close(&mut self) -> std::result::Result<(), ()> {
        match self {
            SinkEither::Plain(sink) => sink.close().await.map_err(|_| ()),
            SinkEither::Tls(sink) => sink.close().await.map_err(|_| ()),
        }
    }
}

impl ReaderEither {
    async fn next_text(&mut self) -> Option<String> {
        loop {
            let message = match self {
                ReaderEither::Plain(reader) => reader.next().await,
                ReaderEither::Tls(reader) => reader.next().await,
            };
            match message {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_onion_address_with_default_port() {
        let addr = RoomAddress::parse("abcdef.onion/!1234:p2p").unwrap();
        assert_eq!(addr.host, "abcdef.onion");
        assert_eq!(addr.port, HIDDEN_SERVICE_BASE_PORT);
        assert_eq!(addr.room_id, "!1234:p2p");
        assert!(addr.via_tor());
    }

    #[test]
    fn parses_explicit_port_and_direct_host() {
        let addr = RoomAddress::parse("127.0.0.1:9999/!ab:p2p").unwrap();
        assert_eq!(addr.port, 9999);
        assert!(!addr.via_tor());
        assert_eq!(addr.url(), "ws://127.0.0.1:9999");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(RoomAddress::parse("no-room-id").is_err());
        assert!(RoomAddress::parse("host.onion/").is_err());
        assert!(RoomAddress::parse("/room").is_err());
        assert!(RoomAddress::parse("host:badport/room").is_err());
    }
}
