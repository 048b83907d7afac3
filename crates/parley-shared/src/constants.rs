use std::time::Duration;

/// Protocol version advertised in the auth challenge and discovery beacon.
pub const PROTOCOL_VERSION: &str = "1.0";

/// First field of every discovery datagram.
pub const DISCOVERY_TAG: &str = "PARLEY";

/// Default WebSocket chat listener port (LAN transport).
pub const DEFAULT_CHAT_PORT: u16 = 55300;

/// HTTP/SSE read-only viewer port.
pub const DEFAULT_VIEWER_PORT: u16 = 55301;

/// UDP discovery broadcast port.
pub const DISCOVERY_PORT: u16 = 55302;

/// First local port used for hidden-service room hosts; each hosted room
/// takes the next one up.
pub const HIDDEN_SERVICE_BASE_PORT: u16 = 55320;

/// Seconds between discovery beacon datagrams.
pub const DISCOVERY_INTERVAL_SECS: u64 = 8;

/// A discovered server entry older than this is considered stale.
pub const DISCOVERY_TTL: Duration = Duration::from_secs(14);

/// Simultaneous connections allowed per origin IP before the handshake is
/// refused.
pub const MAX_CONNS_PER_ORIGIN: usize = 8;

/// Consecutive auth failures from one origin before it is blacklisted for
/// the process lifetime.
pub const AUTH_STRIKE_LIMIT: u32 = 5;

/// Messages allowed per user within a one-second sliding window.
pub const RATE_LIMIT_PER_SEC: usize = 20;

/// Maximum chat message body length after sanitising.
pub const MAX_MESSAGE_LEN: usize = 8192;

pub const MAX_USERNAME_LEN: usize = 32;
pub const MAX_ROOM_NAME_LEN: usize = 80;
pub const MAX_TOPIC_LEN: usize = 200;
pub const MAX_FILENAME_LEN: usize = 128;
pub const MAX_REASON_LEN: usize = 200;

/// Handshake deadline for the LAN transport.
pub const LAN_AUTH_TIMEOUT: Duration = Duration::from_secs(18);

/// Handshake deadline for the P2P transport (Tor round-trips are slow).
pub const P2P_AUTH_TIMEOUT: Duration = Duration::from_secs(25);

/// A `c.ping` is sent when the outbound queue has been idle this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Decoded chunk ceiling per transport.
pub const LAN_CHUNK_BYTES: usize = 64 * 1024;
pub const P2P_CHUNK_BYTES: usize = 32 * 1024;

/// Maximum accepted file size (50 MiB), declared or accumulated.
pub const MAX_FILE_BYTES: usize = 50 * 1024 * 1024;

/// Events replayed to a freshly joined member.
pub const HISTORY_REPLAY_LIMIT: u32 = 50;

/// Hard cap on any single history query.
pub const MAX_HISTORY: u32 = 250;

/// PBKDF2-HMAC-SHA256 iteration count for room passwords.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
