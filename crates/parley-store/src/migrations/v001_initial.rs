//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `rooms`, `members`, `events`, `files`,
//! and `banned`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    room_id       TEXT PRIMARY KEY NOT NULL,   -- "!<16hex>:lan"
    name          TEXT NOT NULL,
    creator       TEXT NOT NULL,               -- username only
    password_hash TEXT NOT NULL,               -- PBKDF2-HMAC-SHA256, hex
    password_salt TEXT NOT NULL,
    public        INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    created_at    INTEGER NOT NULL,            -- epoch millis
    topic         TEXT NOT NULL DEFAULT ''
);

-- ----------------------------------------------------------------
-- Memberships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS members (
    room_id   TEXT NOT NULL,
    username  TEXT NOT NULL,
    role      TEXT NOT NULL DEFAULT 'member',  -- 'admin' | 'member'
    joined_at INTEGER NOT NULL,

    PRIMARY KEY (room_id, username)
);

-- ----------------------------------------------------------------
-- Events
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS events (
    event_id  TEXT PRIMARY KEY NOT NULL,       -- "$<ts_ms>_<6hex>:lan"
    room_id   TEXT NOT NULL,
    sender    TEXT NOT NULL,
    type      TEXT NOT NULL,
    content   TEXT NOT NULL,                   -- JSON
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_room_ts ON events(room_id, timestamp);

-- ----------------------------------------------------------------
-- Stored files (metadata; blobs live content-addressed on disk)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    file_id     TEXT PRIMARY KEY NOT NULL,
    room_id     TEXT NOT NULL,
    sender      TEXT NOT NULL,
    filename    TEXT NOT NULL,                 -- display name only
    size        INTEGER NOT NULL,
    checksum    TEXT NOT NULL,                 -- SHA-256 hex
    stored_name TEXT NOT NULL,                 -- content-addressed blob name
    uploaded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_room ON files(room_id, uploaded_at DESC);

-- ----------------------------------------------------------------
-- Bans
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS banned (
    room_id   TEXT NOT NULL,
    username  TEXT NOT NULL,
    banned_by TEXT NOT NULL,
    reason    TEXT NOT NULL DEFAULT '',
    banned_at INTEGER NOT NULL,

    PRIMARY KEY (room_id, username)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
