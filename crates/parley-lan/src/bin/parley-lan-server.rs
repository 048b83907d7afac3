//! Standalone LAN chat server.
//!
//! Runs the supervised chat server plus the read-only browser viewer.
//! Configuration comes from environment variables (`PARLEY_PORT`,
//! `PARLEY_TOKEN`, `PARLEY_SERVER_NAME`, ...); see
//! [`parley_lan::LanServerConfig::from_env`].

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_lan::{ChatServer, LanServerConfig, ViewerServer};
use parley_shared::constants::DEFAULT_VIEWER_PORT;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_lan=debug")),
        )
        .init();

    info!("Starting Parley LAN server v{}", env!("CARGO_PKG_VERSION"));

    let config = LanServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let mut server = ChatServer::new(config, None);
    if !server.start() {
        anyhow::bail!("chat server failed to start; see log for details");
    }

    let mut viewer = ViewerServer::new(DEFAULT_VIEWER_PORT);
    if !viewer.start() {
        info!("viewer disabled (port busy)");
    }

    info!(
        chat_port = server.port(),
        viewer_port = viewer.port(),
        "Serving; press Ctrl+C to stop"
    );

    // Block the main thread until Ctrl+C; the servers run on their own
    // threads.
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    ctrl_c_handler(stop_tx);
    let _ = stop_rx.recv();

    info!("Shutting down");
    viewer.stop();
    server.stop();
    Ok(())
}

/// Minimal Ctrl+C hook without pulling in a signal crate: a throwaway
/// runtime waiting on tokio's cross-platform signal future.
fn ctrl_c_handler(stop_tx: std::sync::mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        if let Ok(runtime) = runtime {
            runtime.block_on(async {
                let _ = tokio::signal::ctrl_c().await;
            });
        }
        let _ = stop_tx.send(());
    });
}
