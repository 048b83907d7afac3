//! UDP broadcast discovery.
//!
//! The [`Beacon`] announces a running server every few seconds; the
//! [`Scanner`] listens on the same port and keeps a freshness-windowed map
//! of `origin → entry`. Both run on plain std sockets in their own thread;
//! discovery traffic is tiny and has no business on the chat event loop.
//!
//! Datagram payload: pipe-delimited UTF-8
//! `PARLEY|<version>|<server name>|<ws port>|<room count>`.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use parley_shared::constants::{
    DISCOVERY_INTERVAL_SECS, DISCOVERY_PORT, DISCOVERY_TAG, DISCOVERY_TTL, PROTOCOL_VERSION,
};

/// One discovered server.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub room_count: usize,
    pub last_seen: Instant,
}

impl ServerEntry {
    /// Entries older than the freshness window are excluded from results
    /// even though the map is cleaned lazily.
    pub fn is_alive(&self) -> bool {
        self.last_seen.elapsed() < DISCOVERY_TTL
    }

    pub fn display(&self) -> Value {
        json!({
            "ip": self.ip,
            "port": self.port,
            "name": self.name,
            "room_count": self.room_count,
            "address": format!("{}:{}", self.ip, self.port),
        })
    }
}

/// Build the beacon datagram payload.
pub fn beacon_payload(server_name: &str, ws_port: u16, room_count: usize) -> String {
    [
        DISCOVERY_TAG,
        PROTOCOL_VERSION,
        server_name,
        &ws_port.to_string(),
        &room_count.to_string(),
    ]
    .join("|")
}

/// Parse a beacon datagram received from `source_ip`. Foreign or malformed
/// payloads yield `None`.
pub fn parse_beacon(payload: &str, source_ip: &str) -> Option<ServerEntry> {
    let parts: Vec<&str> = payload.split('|').collect();
    if parts.len() < 5 || parts[0] != DISCOVERY_TAG {
        return None;
    }
    Some(ServerEntry {
        ip: source_ip.to_string(),
        port: parts[3].parse().ok()?,
        name: parts[2].to_string(),
        room_count: parts[4].parse().ok()?,
        last_seen: Instant::now(),
    })
}

/// Periodic broadcast announcer for a running server.
pub struct Beacon {
    ws_port: u16,
    server_name: String,
    room_count: Arc<dyn Fn() -> usize + Send + Sync>,
    running: Arc<AtomicBool>,
}

impl Beacon {
    pub fn new(
        ws_port: u16,
        server_name: &str,
        room_count: Arc<dyn Fn() -> usize + Send + Sync>,
    ) -> Self {
        Self {
            ws_port,
            server_name: server_name.to_string(),
            room_count,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.running.clone();
        let name = self.server_name.clone();
        let port = self.ws_port;
        let room_count = self.room_count.clone();

        thread::Builder::new()
            .name("lan-beacon".to_string())
            .spawn(move || {
                let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "Beacon socket bind failed");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                if let Err(e) = socket.set_broadcast(true) {
                    warn!(error = %e, "Beacon broadcast flag failed");
                }

                while running.load(Ordering::SeqCst) {
                    let payload = beacon_payload(&name, port, room_count());
                    if let Err(e) =
                        socket.send_to(payload.as_bytes(), ("255.255.255.255", DISCOVERY_PORT))
                    {
                        debug!(error = %e, "Beacon send failed");
                    }
                    // Sleep in one-second steps so stop() takes effect quickly.
                    for _ in 0..DISCOVERY_INTERVAL_SECS {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            })
            .ok();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Listens for beacon datagrams and maintains a live server list.
pub struct Scanner {
    entries: Arc<Mutex<HashMap<String, ServerEntry>>>,
    running: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.running.clone();
        let entries = self.entries.clone();

        thread::Builder::new()
            .name("lan-scanner".to_string())
            .spawn(move || {
                let socket = match UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, port = DISCOVERY_PORT, "Scanner bind failed");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                if let Err(e) = socket.set_read_timeout(Some(Duration::from_secs(1))) {
                    warn!(error = %e, "Scanner read timeout failed");
                }

                let mut buf = [0u8; 512];
                while running.load(Ordering::SeqCst) {
                    let (len, addr) = match socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(_) => continue, // timeout; re-check the flag
                    };
                    let Ok(payload) = std::str::from_utf8(&buf[..len]) else {
                        continue;
                    };
                    if let Some(entry) = parse_beacon(payload, &addr.ip().to_string()) {
                        let key = format!("{}:{}", entry.ip, entry.port);
                        if let Ok(mut map) = entries.lock() {
                            map.insert(key, entry);
                        }
                    }
                }
            })
            .ok();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Entries seen within the freshness window.
    pub fn servers(&self) -> Vec<ServerEntry> {
        self.entries
            .lock()
            .map(|map| map.values().filter(|e| e.is_alive()).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot discovery: listen for `wait`, then return the live entries.
/// Used for "scan local network" UI actions without a persistent listener.
pub fn discover_servers(wait: Duration) -> Vec<ServerEntry> {
    let scanner = Scanner::new();
    scanner.start();
    thread::sleep(wait);
    scanner.stop();
    scanner.servers()
}
