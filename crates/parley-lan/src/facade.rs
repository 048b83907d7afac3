//! Supervising façade for the embedding application.
//!
//! [`ChatServer`] wraps an inner [`LanServer`] behind the legacy lifecycle
//! surface (`start` / `stop` / `is_open` / `peer_count` / `broadcast`) and
//! adds a watchdog: if the inner server's loop exits while the façade is
//! still enabled, the server is rebuilt and restarted with exponential
//! backoff. Supervision knows nothing about the protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::LanServerConfig;
use crate::server::{LanServer, MessageCallback};

/// Initial watchdog backoff.
const BACKOFF_START: Duration = Duration::from_secs(2);
/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct ChatServer {
    config: LanServerConfig,
    enabled: Arc<AtomicBool>,
    inner: Arc<Mutex<Option<LanServer>>>,
    on_message: Option<MessageCallback>,
    watchdog: Option<thread::JoinHandle<()>>,
}

impl ChatServer {
    pub fn new(config: LanServerConfig, on_message: Option<MessageCallback>) -> Self {
        Self {
            config,
            enabled: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(None)),
            on_message,
            watchdog: None,
        }
    }

    fn build_inner(
        config: &LanServerConfig,
        on_message: &Option<MessageCallback>,
    ) -> Option<LanServer> {
        match LanServer::new(config.clone()) {
            Ok(mut server) => {
                if let Some(callback) = on_message {
                    server.set_message_callback(callback.clone());
                }
                Some(server)
            }
            Err(e) => {
                warn!(error = %e, "could not build chat server");
                None
            }
        }
    }

    /// Build and start the inner server, then spawn the watchdog.
    pub fn start(&mut self) -> bool {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return self.is_open();
        }

        let started = {
            let mut guard = lock(&self.inner);
            let server = Self::build_inner(&self.config, &self.on_message);
            *guard = server;
            guard.as_mut().map(|s| s.start()).unwrap_or(false)
        };

        let enabled = self.enabled.clone();
        let inner = self.inner.clone();
        let config = self.config.clone();
        let on_message = self.on_message.clone();

        let watchdog = thread::Builder::new()
            .name("chat-server-watchdog".to_string())
            .spawn(move || {
                let mut backoff = BACKOFF_START;
                while enabled.load(Ordering::SeqCst) {
                    thread::sleep(backoff);
                    if !enabled.load(Ordering::SeqCst) {
                        break;
                    }
                    let healthy = lock(&inner).as_ref().map(|s| s.is_open()).unwrap_or(false);
                    if healthy {
                        backoff = BACKOFF_START;
                        continue;
                    }

                    warn!(backoff_secs = backoff.as_secs(), "chat server down, restarting");
                    let restarted = {
                        let mut guard = lock(&inner);
                        *guard = Self::build_inner(&config, &on_message);
                        guard.as_mut().map(|s| s.start()).unwrap_or(false)
                    };
                    if restarted {
                        info!("chat server restarted");
                        backoff = BACKOFF_START;
                    } else {
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            });
        self.watchdog = watchdog.ok();

        started
    }

    pub fn stop(&mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(server) = lock(&self.inner).as_mut() {
            server.stop();
        }
        self.watchdog.take();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner).as_ref().map(|s| s.is_open()).unwrap_or(false)
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.inner)
            .as_ref()
            .map(|s| s.peer_count())
            .unwrap_or(0)
    }

    /// Actual listener port of the running inner server.
    pub fn port(&self) -> u16 {
        lock(&self.inner).as_ref().map(|s| s.port()).unwrap_or(0)
    }

    /// Broadcast a plain-text line to all connected peers in every room.
    pub fn send(&self, text: &str) {
        if let Some(server) = lock(&self.inner).as_ref() {
            server.broadcast_text(text);
        }
    }

    /// Alias for [`ChatServer::send`]; keeps legacy callers working.
    pub fn broadcast(&self, text: &str) {
        self.send(text);
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
