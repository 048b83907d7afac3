//! Persistent identity profile.
//!
//! The long-term Ed25519 key is generated on first use and written to a
//! local JSON profile file; the derived public identifier never changes
//! after that. Only the display username is mutable. The secret never
//! leaves this file; the wire only ever carries the derived id, the
//! ephemeral session key and an HMAC proof.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use parley_shared::identity::{normalise_username, Identity, SessionKey};

use crate::error::{P2pError, Result};

#[derive(Serialize, Deserialize)]
struct ProfileFile {
    username: String,
    public_id: String,
    secret_hex: String,
}

/// A loaded identity profile plus this run's ephemeral session key.
pub struct IdentityProfile {
    path: PathBuf,
    username: String,
    identity: Identity,
    session: SessionKey,
}

impl IdentityProfile {
    /// Load the profile at `path`, creating a fresh identity if the file
    /// does not exist or holds no usable key.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match Self::read_file(path) {
            Some(file) => {
                let identity = Identity::from_secret_hex(&file.secret_hex)
                    .map_err(|e| P2pError::Profile(e.to_string()))?;
                Ok(Self {
                    path: path.to_path_buf(),
                    username: normalise_username(&file.username),
                    identity,
                    session: SessionKey::generate(),
                })
            }
            None => {
                let profile = Self {
                    path: path.to_path_buf(),
                    username: "anonymous".to_string(),
                    identity: Identity::generate(),
                    session: SessionKey::generate(),
                };
                profile.save()?;
                info!(public_id = %profile.public_id(), "created new identity profile");
                Ok(profile)
            }
        }
    }

    /// Default profile location in the platform data directory.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("net", "parley", "parley")
            .ok_or_else(|| P2pError::Profile("no data directory".to_string()))?;
        Ok(dirs.data_dir().join("identity.json"))
    }

    fn read_file(path: &Path) -> Option<ProfileFile> {
        let raw = std::fs::read_to_string(path).ok()?;
        let file: ProfileFile = serde_json::from_str(&raw).ok()?;
        if file.secret_hex.is_empty() {
            return None;
        }
        Some(file)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ProfileFile {
            username: self.username.clone(),
            public_id: self.public_id(),
            secret_hex: hex::encode(self.identity.secret_bytes()),
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| P2pError::Profile(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: &str) {
        self.username = normalise_username(username);
        if let Err(e) = self.save() {
            warn!(error = %e, "could not persist username change");
        }
    }

    pub fn public_id(&self) -> String {
        self.identity.public_id()
    }

    pub fn session_pubkey_hex(&self) -> String {
        self.session.public_hex()
    }

    /// Sign a message body with this run's session key.
    pub fn sign(&self, data: &[u8]) -> String {
        self.session.sign(data)
    }

    /// Proof that this session belongs to the long-term identity.
    pub fn auth_token(&self) -> String {
        self.identity.auth_token(&self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_profile_is_created_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let profile = IdentityProfile::load_or_create(&path).unwrap();
        assert_eq!(profile.username(), "anonymous");
        let id = profile.public_id();
        assert!(id.starts_with("did:parley:"));
        assert!(path.exists());

        // Reloading keeps the same identity but a new session key.
        let session_before = profile.session_pubkey_hex();
        drop(profile);
        let reloaded = IdentityProfile::load_or_create(&path).unwrap();
        assert_eq!(reloaded.public_id(), id);
        assert_ne!(reloaded.session_pubkey_hex(), session_before);
    }

    #[test]
    fn username_change_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let mut profile = IdentityProfile::load_or_create(&path).unwrap();
        profile.set_username("alice");
        drop(profile);

        let reloaded = IdentityProfile::load_or_create(&path).unwrap();
        assert_eq!(reloaded.username(), "alice");
    }

    #[test]
    fn corrupt_profile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json").unwrap();

        let profile = IdentityProfile::load_or_create(&path).unwrap();
        assert!(profile.public_id().starts_with("did:parley:"));
    }
}
