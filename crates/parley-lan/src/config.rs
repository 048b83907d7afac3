//! Server and client configuration.
//!
//! All settings have defaults so a server can start with zero configuration;
//! environment variables override them for deployments.

use std::path::PathBuf;

use parley_shared::constants::DEFAULT_CHAT_PORT;

/// Configuration for a [`crate::LanServer`].
#[derive(Debug, Clone)]
pub struct LanServerConfig {
    /// TCP port for the WebSocket listener. `0` binds an ephemeral port
    /// (useful in tests).
    /// Env: `PARLEY_PORT`
    pub port: u16,

    /// Interface to bind.
    /// Env: `PARLEY_BIND`
    /// Default: `0.0.0.0`
    pub bind_addr: String,

    /// Human-readable server name, shown in discovery and the challenge.
    /// Env: `PARLEY_SERVER_NAME`
    pub server_name: String,

    /// Shared secret clients must prove knowledge of during the handshake.
    /// Env: `PARLEY_TOKEN`
    pub token: String,

    /// Database file path. `None` uses the platform data directory.
    /// Env: `PARLEY_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Directory for content-addressed file blobs. `None` derives a
    /// `transfers` directory next to the database.
    /// Env: `PARLEY_TRANSFER_DIR`
    pub transfer_dir: Option<PathBuf>,

    /// Whether to announce this server via UDP broadcast.
    pub enable_beacon: bool,
}

impl Default for LanServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CHAT_PORT,
            bind_addr: "0.0.0.0".to_string(),
            server_name: "Parley LAN".to_string(),
            token: "parley".to_string(),
            db_path: None,
            transfer_dir: None,
            enable_beacon: true,
        }
    }
}

impl LanServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PARLEY_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.port = parsed,
                Err(_) => {
                    tracing::warn!(value = %port, "Invalid PARLEY_PORT, using default");
                }
            }
        }

        if let Ok(bind) = std::env::var("PARLEY_BIND") {
            config.bind_addr = bind;
        }

        if let Ok(name) = std::env::var("PARLEY_SERVER_NAME") {
            if !name.is_empty() {
                config.server_name = name;
            }
        }

        if let Ok(token) = std::env::var("PARLEY_TOKEN") {
            if !token.is_empty() {
                config.token = token;
            }
        }

        if let Ok(path) = std::env::var("PARLEY_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("PARLEY_TRANSFER_DIR") {
            config.transfer_dir = Some(PathBuf::from(path));
        }

        config
    }
}

/// Configuration for a [`crate::LanClient`].
#[derive(Debug, Clone)]
pub struct LanClientConfig {
    /// Display name; the only identity the server keeps.
    pub username: String,

    /// Shared secret matching the server's token.
    pub token: String,

    /// Where received files are written.
    pub download_dir: PathBuf,
}

impl LanClientConfig {
    pub fn new(username: &str, token: &str, download_dir: PathBuf) -> Self {
        Self {
            username: parley_shared::identity::normalise_username(username),
            token: token.to_string(),
            download_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LanServerConfig::default();
        assert_eq!(config.port, DEFAULT_CHAT_PORT);
        assert!(config.enable_beacon);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn client_config_normalises_username() {
        let config = LanClientConfig::new("", "tok", PathBuf::from("/tmp"));
        assert_eq!(config.username, "anonymous");
    }
}
