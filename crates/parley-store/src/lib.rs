//! # parley-store
//!
//! Embedded SQLite persistence for one LAN chat server instance: rooms,
//! memberships, message history, stored-file metadata and room bans.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers per domain model. Room
//! passwords are stored as salted PBKDF2 hashes only; no plaintext ever
//! reaches this layer.

pub mod bans;
pub mod database;
pub mod events;
pub mod files;
pub mod migrations;
pub mod models;
pub mod rooms;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
