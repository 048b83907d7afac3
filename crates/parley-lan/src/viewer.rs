//! Read-only HTTP viewer.
//!
//! A tiny axum server for browsers on the LAN: `GET /` serves a static
//! page, `GET /stream` is a server-sent-events feed of transcript/chat
//! lines pushed through [`ViewerServer::push`]. Strictly one-way; viewers
//! cannot send anything into the chat.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const PAGE: &str = r#"<!doctype html><html><head><meta charset="utf-8">
<title>Parley Live</title>
<style>body{background:#060c1a;color:#00bdff;font-family:monospace;padding:16px;}</style>
</head><body><h2>PARLEY &mdash; Live Transcript</h2><div id="log"></div>
<script>
const el=document.getElementById('log');
const es=new EventSource('/stream');
es.onmessage=e=>{el.textContent+=e.data+'\n';window.scrollTo(0,document.body.scrollHeight);};
</script></body></html>"#;

/// HTTP/SSE push server for read-only browser viewers.
pub struct ViewerServer {
    port: u16,
    tx: broadcast::Sender<String>,
    running: Arc<AtomicBool>,
    bound_port: Arc<AtomicU16>,
    shutdown: Option<watch::Sender<bool>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ViewerServer {
    pub fn new(port: u16) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            port,
            tx,
            running: Arc::new(AtomicBool::new(false)),
            bound_port: Arc::new(AtomicU16::new(0)),
            shutdown: None,
            thread: None,
        }
    }

    pub fn start(&mut self) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return false;
        }
        let listener = match std::net::TcpListener::bind(("0.0.0.0", self.port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!(port = self.port, error = %e, "viewer bind failed");
                return false;
            }
        };
        if listener.set_nonblocking(true).is_err() {
            return false;
        }
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(self.port);
        self.bound_port.store(port, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        let running = self.running.clone();
        let tx = self.tx.clone();

        let handle = thread::Builder::new()
            .name("viewer-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "viewer runtime build failed");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!(error = %e, "viewer listener registration failed");
                            return;
                        }
                    };
                    info!(port = port, "viewer online");
                    let router = build_router(tx);
                    let serve = axum::serve(listener, router).with_graceful_shutdown(
                        async move {
                            let _ = shutdown_rx.changed().await;
                        },
                    );
                    if let Err(e) = serve.await {
                        error!(error = %e, "viewer server failed");
                    }
                });
                running.store(false, Ordering::SeqCst);
            });
        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
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
        info!("viewer offline");
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    /// Push one line to every connected viewer. Slow viewers lag and skip
    /// rather than applying backpressure to the caller.
    pub fn push(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }
}

impl Drop for ViewerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_router(tx: broadcast::Sender<String>) -> Router {
    Router::new()
        .route("/", get(page))
        .route("/stream", get(stream))
        .layer(TraceLayer::new_for_http())
        .with_state(tx)
}

async fn page() -> Html<&'static str> {
    Html(PAGE)
}

async fn stream(
    State(tx): State<broadcast::Sender<String>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = tx.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => return Some((Ok(Event::default().data(line)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(20))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_and_push() {
        let mut viewer = ViewerServer::new(0);
        assert!(viewer.start());
        assert!(viewer.is_open());
        assert_ne!(viewer.port(), 0);
        // No subscribers yet; push must not error or block.
        viewer.push("line one");
        viewer.stop();
        assert!(!viewer.is_open());
    }
}
