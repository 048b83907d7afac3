use thiserror::Error;

/// Errors surfaced by the P2P transport.
#[derive(Error, Debug)]
pub enum P2pError {
    /// The local Tor daemon is not reachable. The message is actionable:
    /// it tells the user what to install and start.
    #[error("Tor unavailable: {0}")]
    TorUnavailable(String),

    #[error("Tor control protocol error: {0}")]
    TorControl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Identity profile error: {0}")]
    Profile(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The host refused the join; the string is the wire `reason`.
    #[error("Join rejected: {0}")]
    Rejected(String),

    #[error("Invalid room address: {0}")]
    AddressParse(String),

    #[error("Node not started")]
    NotStarted,
}

pub type Result<T> = std::result::Result<T, P2pError>;
