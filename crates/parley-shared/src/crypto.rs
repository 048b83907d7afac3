//! Password hashing, handshake proofs and checksums.
//!
//! Room passwords are PBKDF2-HMAC-SHA256 with a per-room salt; handshake
//! proofs are HMAC-SHA256 over a random challenge; file integrity is plain
//! SHA-256. All comparisons of secret-derived material are constant-time.

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::constants::PBKDF2_ITERATIONS;

type HmacSha256 = Hmac<Sha256>;

/// Generate a fresh per-room salt (16 random bytes, hex-encoded).
pub fn make_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random handshake challenge (32 bytes).
pub fn make_challenge() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// PBKDF2-HMAC-SHA256 room password hash, hex-encoded.
pub fn hash_room_password(password: &str, salt: &str) -> String {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut out,
    );
    hex::encode(out)
}

/// Constant-time check of a supplied password against a stored hash+salt.
pub fn verify_room_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    let candidate = hash_room_password(password, salt);
    ct_eq(candidate.as_bytes(), expected_hash.as_bytes())
}

/// HMAC-SHA256 proof over a handshake challenge, hex-encoded.
///
/// The LAN transport keys this with the shared server token; the P2P
/// transport keys it with the long-term identity secret over the ephemeral
/// session public key.
pub fn sign_challenge(secret: &[u8], challenge: &[u8]) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail.
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time equality for secret-derived byte strings.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// SHA-256 of a byte slice, hex-encoded. Used for file checksums and
/// content-addressed storage names.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_deterministic_per_salt() {
        let salt = make_salt();
        let a = hash_room_password("secret", &salt);
        let b = hash_room_password("secret", &salt);
        assert_eq!(a, b);

        let other_salt = make_salt();
        assert_ne!(a, hash_room_password("secret", &other_salt));
    }

    #[test]
    fn verify_accepts_correct_rejects_wrong() {
        let salt = make_salt();
        let stored = hash_room_password("hunter2", &salt);
        assert!(verify_room_password("hunter2", &salt, &stored));
        assert!(!verify_room_password("hunter3", &salt, &stored));
        assert!(!verify_room_password("", &salt, &stored));
    }

    #[test]
    fn challenge_proofs_depend_on_key() {
        let challenge = make_challenge();
        let a = sign_challenge(b"token-a", &challenge);
        let b = sign_challenge(b"token-b", &challenge);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn ct_eq_handles_length_mismatch() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"short", b"longer"));
    }
}
