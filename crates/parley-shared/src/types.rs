use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier namespace, so ids never collide across transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Realm {
    Lan,
    P2p,
}

impl Realm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Lan => "lan",
            Realm::P2p => "p2p",
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership role inside a room. The creator is always `Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Role {
        match s {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generate a room id of the form `!<16hex>:<realm>`.
pub fn make_room_id(realm: Realm) -> String {
    let mut bytes = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    format!("!{}:{}", hex::encode(bytes), realm)
}

/// Generate an event id of the form `$<epoch_ms>_<6hex>:<realm>`.
///
/// The millisecond prefix gives lexicographic approximate ordering without
/// a central counter; the random suffix breaks same-millisecond ties.
pub fn make_event_id(realm: Realm) -> String {
    let mut bytes = [0u8; 3];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    format!("${}_{}:{}", now_ms(), hex::encode(bytes), realm)
}

/// Generate a short opaque token (transfer ids, file ids).
pub fn make_token() -> String {
    let mut bytes = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    hex::encode(bytes)
}

/// Strip control characters, trim whitespace and cap the length.
///
/// Tabs and newlines survive; everything else below 0x20 plus DEL is
/// removed before the length cap is applied.
pub fn sanitise(raw: &str, max_len: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '\u{00}'..='\u{08}' | '\u{0b}'..='\u{1f}' | '\u{7f}'))
        .collect();
    cleaned.trim().chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_format() {
        let id = make_room_id(Realm::Lan);
        assert!(id.starts_with('!'));
        assert!(id.ends_with(":lan"));
        // "!<16hex>:lan"
        assert_eq!(id.len(), 1 + 16 + 4);
    }

    #[test]
    fn event_ids_order_by_time() {
        let a = make_event_id(Realm::P2p);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = make_event_id(Realm::P2p);
        assert!(a < b);
        assert!(a.ends_with(":p2p"));
    }

    #[test]
    fn sanitise_strips_control_chars() {
        assert_eq!(sanitise("he\u{0}llo\u{7f}", 100), "hello");
        assert_eq!(sanitise("  padded  ", 100), "padded");
        assert_eq!(sanitise("abcdef", 3), "abc");
        // Tabs and newlines are kept
        assert_eq!(sanitise("a\tb\nc", 100), "a\tb\nc");
    }

    #[test]
    fn role_round_trip() {
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("member"), Role::Member);
        assert_eq!(Role::parse("garbage"), Role::Member);
        assert_eq!(Role::Admin.as_str(), "admin");
    }
}
