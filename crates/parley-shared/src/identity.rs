//! Long-term and ephemeral identity material for the P2P transport.
//!
//! The long-term Ed25519 key is generated once and persisted by the caller;
//! the public identifier derived from it never changes. A fresh session key
//! is generated every process run and used only for signing messages within
//! that run.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::crypto::sign_challenge;
use crate::error::IdentityError;
use crate::types::sanitise;

/// Prefix of every derived public identifier.
pub const PUBLIC_ID_PREFIX: &str = "did:parley:";

/// A user's persistent cryptographic identity.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32 secret key bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Restore an identity from a hex-encoded secret key.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(hex_str).map_err(|_| IdentityError::InvalidKeyBytes)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The stable public identifier: `did:parley:<base58(sha256(pubkey)[..16])>`.
    ///
    /// Derived from the public key only, so it can be recomputed on any
    /// device holding the secret and never changes once created.
    pub fn public_id(&self) -> String {
        let digest = Sha256::digest(self.public_key_bytes());
        format!("{}{}", PUBLIC_ID_PREFIX, base58_encode(&digest[..16]))
    }

    /// Prove ownership of the long-term key over an ephemeral session key:
    /// `HMAC-SHA256(long_term_secret, session_pubkey_hex)`.
    pub fn auth_token(&self, session: &SessionKey) -> String {
        sign_challenge(self.secret_bytes(), session.public_hex().as_bytes())
    }
}

/// Ephemeral per-run signing key.
pub struct SessionKey {
    signing_key: SigningKey,
}

impl SessionKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message body, returning the hex-encoded signature.
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }
}

/// Verify a hex-encoded session signature against a hex-encoded public key.
pub fn verify_session_signature(
    pubkey_hex: &str,
    data: &[u8],
    signature_hex: &str,
) -> Result<(), IdentityError> {
    let pubkey_bytes: [u8; 32] = hex::decode(pubkey_hex)
        .map_err(|_| IdentityError::InvalidKeyBytes)?
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;

    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|_| IdentityError::InvalidSignature)?
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(data, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// Normalise a display username; empty input falls back to `"anonymous"`.
pub fn normalise_username(raw: &str) -> String {
    let name = sanitise(raw, crate::constants::MAX_USERNAME_LEN);
    if name.is_empty() {
        "anonymous".to_string()
    } else {
        name
    }
}

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Bitcoin-alphabet base58 (no checksum); enough for short id suffixes.
fn base58_encode(data: &[u8]) -> String {
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 2);
    for &byte in data {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|&&b| b == 0).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(BASE58_ALPHABET[digit as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_id_is_stable() {
        let id = Identity::generate();
        assert_eq!(id.public_id(), id.public_id());
        assert!(id.public_id().starts_with(PUBLIC_ID_PREFIX));

        let restored = Identity::from_secret_bytes(id.secret_bytes());
        assert_eq!(id.public_id(), restored.public_id());
    }

    #[test]
    fn distinct_identities_get_distinct_ids() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.public_id(), b.public_id());
    }

    #[test]
    fn hex_round_trip() {
        let id = Identity::generate();
        let restored = Identity::from_secret_hex(&hex::encode(id.secret_bytes())).unwrap();
        assert_eq!(id.public_id(), restored.public_id());

        assert!(Identity::from_secret_hex("zz").is_err());
        assert!(Identity::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn session_signature_verifies() {
        let session = SessionKey::generate();
        let sig = session.sign(b"hello");
        assert!(verify_session_signature(&session.public_hex(), b"hello", &sig).is_ok());
        assert!(verify_session_signature(&session.public_hex(), b"other", &sig).is_err());
    }

    #[test]
    fn auth_token_binds_both_keys() {
        let identity = Identity::generate();
        let s1 = SessionKey::generate();
        let s2 = SessionKey::generate();
        assert_ne!(identity.auth_token(&s1), identity.auth_token(&s2));
        // Deterministic for the same pair
        assert_eq!(identity.auth_token(&s1), identity.auth_token(&s1));
    }

    #[test]
    fn base58_known_values() {
        assert_eq!(base58_encode(&[]), "");
        assert_eq!(base58_encode(&[0]), "1");
        assert_eq!(base58_encode(&[0, 0, 1]), "112");
    }

    #[test]
    fn username_fallback() {
        assert_eq!(normalise_username(""), "anonymous");
        assert_eq!(normalise_username("  \u{0}  "), "anonymous");
        assert_eq!(normalise_username("alice"), "alice");
    }
}
