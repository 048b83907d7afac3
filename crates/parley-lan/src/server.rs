//! WebSocket LAN chat server.
//!
//! The server owns a dedicated worker thread running a single-threaded
//! tokio runtime; each accepted connection gets its own task on that loop.
//! The embedding application's thread never blocks on chat I/O: `start`
//! binds synchronously and returns, everything else happens on the loop.
//!
//! Per-connection lifecycle: origin check → HMAC challenge/response →
//! authenticated dispatch loop → teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use parley_shared::constants::{LAN_AUTH_TIMEOUT, MAX_USERNAME_LEN};
use parley_shared::crypto::{ct_eq, make_challenge, sign_challenge};
use parley_shared::protocol::ClientCommand;
use parley_shared::types::sanitise;
use parley_shared::{ErrorCode, Frame};
use parley_store::Database;

use crate::config::LanServerConfig;
use crate::discovery::Beacon;
use crate::guard::OriginVerdict;
use crate::state::{ServerState, Session};
use crate::transfer::default_transfer_dir;
use crate::LanError;

/// Callback invoked with `(username, message_text)` on every inbound chat
/// message; used by the embedding application.
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Lock the shared state, recovering from a poisoned lock rather than
/// propagating the panic of an unrelated connection task.
fn lock_state(state: &Arc<Mutex<ServerState>>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// WebSocket LAN group-chat server.
///
/// ```no_run
/// use parley_lan::{LanServer, LanServerConfig};
///
/// let mut server = LanServer::new(LanServerConfig::default()).unwrap();
/// server.start();
/// // ...
/// server.stop();
/// ```
pub struct LanServer {
    config: Arc<LanServerConfig>,
    state: Arc<Mutex<ServerState>>,
    running: Arc<AtomicBool>,
    bound_port: Arc<AtomicU16>,
    shutdown: Option<watch::Sender<bool>>,
    thread: Option<thread::JoinHandle<()>>,
    beacon: Option<Beacon>,
    on_message: Option<MessageCallback>,
}

impl LanServer {
    /// Open the persistence store and build an idle server.
    pub fn new(config: LanServerConfig) -> Result<Self, LanError> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let transfer_dir = match &config.transfer_dir {
            Some(dir) => dir.clone(),
            None => db
                .path()
                .map(|p| default_transfer_dir(&p))
                .unwrap_or_else(|| std::env::temp_dir().join("parley-transfers")),
        };
        let state = ServerState::new(&config.server_name, db, transfer_dir);

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            running: Arc::new(AtomicBool::new(false)),
            bound_port: Arc::new(AtomicU16::new(0)),
            shutdown: None,
            thread: None,
            beacon: None,
            on_message: None,
        })
    }

    /// Register the inbound-message callback before starting.
    pub fn set_message_callback(&mut self, callback: MessageCallback) {
        self.on_message = Some(callback);
    }

    /// Bind the listener and start the event loop on its own thread.
    /// Returns `false` if already running or the bind fails.
    pub fn start(&mut self) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return false;
        }

        let listener = match std::net::TcpListener::bind((
            self.config.bind_addr.as_str(),
            self.config.port,
        )) {
            Ok(listener) => listener,
            Err(e) => {
                error!(port = self.config.port, error = %e, "chat listener bind failed");
                return false;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!(error = %e, "could not set listener non-blocking");
            return false;
        }
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.port);
        self.bound_port.store(port, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        let state = self.state.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        let callback = self.on_message.clone();

        let handle = thread::Builder::new()
            .name("lan-ws-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "runtime build failed");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                runtime.block_on(run_server(listener, state, config, callback, shutdown_rx));
                running.store(false, Ordering::SeqCst);
            });
        match handle {
            Ok(handle) => self.thread = Some(handle),
            Err(e) => {
                error!(error = %e, "server thread spawn failed");
                self.running.store(false, Ordering::SeqCst);
                return false;
            }
        }

        if self.config.enable_beacon {
            let state = self.state.clone();
            let beacon = Beacon::new(
                port,
                &self.config.server_name,
                Arc::new(move || lock_state(&state).room_count()),
            );
            beacon.start();
            self.beacon = Some(beacon);
        }

        info!(
            name = %self.config.server_name,
            port = port,
            "LAN chat server online"
        );
        true
    }

    /// Schedule loop shutdown and stop announcing. The persistence handle
    /// closes when the last connection task releases the state.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(beacon) = self.beacon.take() {
            beacon.stop();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.thread.take();
        info!(name = %self.config.server_name, "LAN chat server offline");
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        lock_state(&self.state).peer_count()
    }

    /// Actual bound port (differs from the configured one when port 0 was
    /// requested).
    pub fn port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    /// Mirror a text line to every connected session. Thread-safe: the
    /// frame is queued onto each connection's own writer.
    pub fn broadcast_text(&self, text: &str) {
        lock_state(&self.state).broadcast_text(text);
    }
}

impl Drop for LanServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_server(
    listener: std::net::TcpListener,
    state: Arc<Mutex<ServerState>>,
    config: Arc<LanServerConfig>,
    callback: Option<MessageCallback>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "listener registration failed");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            state.clone(),
                            config.clone(),
                            callback.clone(),
                            stream,
                            peer,
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    debug!("server loop terminated");
}

/// Per-connection protocol state machine:
/// `Connecting → AwaitingAuth → Authenticated → Dispatching → Closed`.
async fn handle_connection(
    state: Arc<Mutex<ServerState>>,
    config: Arc<LanServerConfig>,
    callback: Option<MessageCallback>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let origin = peer.ip();

    // Origin check happens before the WebSocket upgrade, so a blacklisted
    // origin never even sees a challenge.
    match lock_state(&state).guard.admit(origin) {
        OriginVerdict::Allowed => {}
        OriginVerdict::Blacklisted => {
            debug!(origin = %origin, "refused blacklisted origin");
            return;
        }
        OriginVerdict::TooManyConnections => {
            debug!(origin = %origin, "refused origin over connection ceiling");
            return;
        }
    }

    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "websocket upgrade failed");
            lock_state(&state).guard.release(origin);
            return;
        }
    };
    let (mut sink, mut reader) = ws.split();

    // All outbound frames funnel through one writer task per connection.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if sink.send(Message::Text(raw)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let username = authenticate(&state, &config, &tx, &mut reader, origin).await;
    if let Some(username) = username {
        dispatch_loop(&state, &callback, &username, &mut reader).await;
        lock_state(&state).disconnect(&username);
    }

    lock_state(&state).guard.release(origin);
    drop(tx);
    let _ = writer.await;
}

/// Run the challenge/response handshake. Returns the registered username
/// on success; on failure the rejection has already been queued.
async fn authenticate(
    state: &Arc<Mutex<ServerState>>,
    config: &Arc<LanServerConfig>,
    tx: &mpsc::UnboundedSender<String>,
    reader: &mut WsReader,
    origin: std::net::IpAddr,
) -> Option<String> {
    let challenge = make_challenge();
    let challenge_frame =
        Frame::auth_challenge(&hex::encode(challenge), &config.server_name);
    tx.send(challenge_frame.to_json()).ok()?;

    let reply = match timeout(LAN_AUTH_TIMEOUT, next_text(reader)).await {
        Ok(Some(raw)) => raw,
        _ => {
            debug!(origin = %origin, "handshake timed out");
            return None;
        }
    };

    let auth = Frame::parse(&reply)
        .and_then(|frame| ClientCommand::decode(&frame))
        .and_then(|cmd| match cmd {
            ClientCommand::Auth(reply) => Some(reply),
            _ => None,
        });

    let Some(auth) = auth else {
        let _ = tx.send(Frame::error(ErrorCode::Unauthorized, "Auth required.").to_json());
        return None;
    };

    let username = sanitise(&auth.username, MAX_USERNAME_LEN);
    let expected = sign_challenge(config.token.as_bytes(), &challenge);
    if username.is_empty() || !ct_eq(auth.response.as_bytes(), expected.as_bytes()) {
        let blacklisted = lock_state(state).guard.strike(origin);
        if blacklisted {
            warn!(origin = %origin, "origin blacklisted after repeated auth failures");
        }
        let _ = tx.send(Frame::error(ErrorCode::Unauthorized, "Auth failed.").to_json());
        return None;
    }

    {
        let mut st = lock_state(state);
        if st.sessions.contains_key(&username) {
            let _ = tx.send(
                Frame::error(
                    ErrorCode::UserInUse,
                    &format!("'{username}' is already connected."),
                )
                .to_json(),
            );
            return None;
        }
        st.guard.clear_strikes(origin);
        st.sessions.insert(
            username.clone(),
            Session {
                username: username.clone(),
                origin,
                tx: tx.clone(),
                joined: Default::default(),
                rate: Default::default(),
            },
        );
        let _ = tx.send(Frame::auth_ok(&username, &config.server_name).to_json());
    }

    info!(username = %username, "session authenticated");
    Some(username)
}

/// Authenticated read loop: rate-check, decode, dispatch. Malformed and
/// unknown frames are dropped without closing the connection.
async fn dispatch_loop(
    state: &Arc<Mutex<ServerState>>,
    callback: &Option<MessageCallback>,
    username: &str,
    reader: &mut WsReader,
) {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let mut callback_payload = None;
        {
            let mut st = lock_state(state);
            if let Some(frame) = Frame::parse(&text) {
                match ClientCommand::decode(&frame) {
                    // The sliding window guards chat traffic; file chunks
                    // are bounded by their own size ceilings instead.
                    Some(ClientCommand::Message { .. })
                        if !st.rate_allow(username, Instant::now()) =>
                    {
                        st.send_to(
                            username,
                            &Frame::error(ErrorCode::RateLimited, "Slow down."),
                        );
                    }
                    Some(command) => {
                        callback_payload =
                            st.dispatch(username, frame.room_id.as_deref(), command);
                    }
                    None => debug!(kind = %frame.kind, "dropping unknown frame"),
                }
            } else {
                debug!("dropping malformed frame");
            }
        }

        // The embedder callback runs outside the state lock; a slow
        // consumer must not stall other connections.
        if let (Some(callback), Some((sender, body))) = (callback, callback_payload) {
            callback(&sender, &body);
        }
    }
}

/// Next text payload from the socket; `None` on close or error.
async fn next_text(reader: &mut WsReader) -> Option<String> {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}
