//! # parley-p2p
//!
//! Peer-to-peer chat transport routed over Tor. No servers, no accounts:
//! the first peer to create a room hosts it behind an ephemeral hidden
//! service, and members connect through the local SOCKS proxy using the
//! room's self-certifying rendezvous address.
//!
//! Identity is a persistent Ed25519 key whose derived public id is the
//! only durable identifier; display names are enforced unique per room by
//! the host at join time. Rooms and history are in-memory only; nothing
//! is persisted beyond the identity profile.

pub mod client;
pub mod host;
pub mod node;
pub mod profile;
pub mod tor;

mod error;

pub use client::{JoinCredentials, RoomAddress, RoomConnection};
pub use error::P2pError;
pub use host::{EventCallback, HostedRoom, RoomHost};
pub use node::P2pNode;
pub use profile::IdentityProfile;
