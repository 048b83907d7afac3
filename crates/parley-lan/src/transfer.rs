//! Chunked, checksum-verified file transfer.
//!
//! Uploads arrive as `c.file.begin` / `c.file.chunk` / `c.file.end` frames
//! multiplexed over the chat channel. A transfer exists only between begin
//! and end; on success the bytes are written content-addressed (the SHA-256
//! checksum is the blob name) and a metadata row is persisted. A corrupted
//! stream is discarded, never partially stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, warn};

use parley_shared::constants::{LAN_CHUNK_BYTES, MAX_FILE_BYTES};
use parley_shared::crypto::{ct_eq, sha256_hex};
use parley_shared::types::{make_token, sanitise};
use parley_shared::ErrorCode;

/// An upload in flight.
#[derive(Debug)]
pub struct InboundTransfer {
    pub transfer_id: String,
    pub room_id: String,
    pub sender: String,
    pub filename: String,
    pub declared_size: u64,
    pub checksum: String,
    buffer: Vec<u8>,
}

impl InboundTransfer {
    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }
}

/// Outcome of feeding one chunk into a transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    /// Unknown transfer id or sender mismatch; the frame is dropped.
    Ignored,
    /// The chunk or the accumulated size crossed a ceiling; the transfer is
    /// discarded.
    Rejected(ErrorCode),
}

/// Holds all in-flight uploads for one server instance.
#[derive(Debug, Default)]
pub struct TransferManager {
    transfers: HashMap<String, InboundTransfer>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new transfer. The declared size is checked against the 50 MiB
    /// ceiling before any chunk is accepted.
    pub fn begin(
        &mut self,
        room_id: &str,
        sender: &str,
        filename: &str,
        declared_size: u64,
        checksum: &str,
    ) -> Result<String, ErrorCode> {
        if declared_size as usize > MAX_FILE_BYTES {
            return Err(ErrorCode::TooLarge);
        }
        // Keep only the final path component of whatever the client sent.
        let base_name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file.txt");
        let filename = sanitise(base_name, parley_shared::constants::MAX_FILENAME_LEN);

        let transfer_id = make_token();
        self.transfers.insert(
            transfer_id.clone(),
            InboundTransfer {
                transfer_id: transfer_id.clone(),
                room_id: room_id.to_string(),
                sender: sender.to_string(),
                filename,
                declared_size,
                checksum: checksum.to_lowercase(),
                buffer: Vec::new(),
            },
        );
        Ok(transfer_id)
    }

    /// Append a base64 chunk. Oversized chunks or accumulation past the
    /// file ceiling discard the whole transfer.
    pub fn append(&mut self, transfer_id: &str, sender: &str, data_b64: &str) -> ChunkOutcome {
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            return ChunkOutcome::Ignored;
        };
        if transfer.sender != sender {
            return ChunkOutcome::Ignored;
        }
        let Ok(data) = BASE64.decode(data_b64) else {
            self.transfers.remove(transfer_id);
            return ChunkOutcome::Rejected(ErrorCode::FileError);
        };
        if data.len() > LAN_CHUNK_BYTES {
            self.transfers.remove(transfer_id);
            return ChunkOutcome::Rejected(ErrorCode::FileError);
        }
        if transfer.buffer.len() + data.len() > MAX_FILE_BYTES {
            self.transfers.remove(transfer_id);
            return ChunkOutcome::Rejected(ErrorCode::TooLarge);
        }
        transfer.buffer.extend_from_slice(&data);
        ChunkOutcome::Accepted
    }

    /// Take a finished transfer out of the in-flight map.
    pub fn finish(&mut self, transfer_id: &str, sender: &str) -> Option<InboundTransfer> {
        match self.transfers.get(transfer_id) {
            Some(transfer) if transfer.sender == sender => self.transfers.remove(transfer_id),
            _ => None,
        }
    }

    /// Drop any transfers owned by a disconnecting sender.
    pub fn abort_for_sender(&mut self, sender: &str) {
        self.transfers.retain(|_, t| t.sender != sender);
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }
}

/// Verify a completed transfer: received bytes must equal the declared size
/// and re-hash to the declared checksum.
pub fn verify(transfer: &InboundTransfer) -> Result<&[u8], ErrorCode> {
    if transfer.received() != transfer.declared_size {
        return Err(ErrorCode::FileError);
    }
    let actual = sha256_hex(&transfer.buffer);
    if !transfer.checksum.is_empty() && !ct_eq(actual.as_bytes(), transfer.checksum.as_bytes()) {
        return Err(ErrorCode::FileError);
    }
    Ok(&transfer.buffer)
}

/// Write verified bytes to content-addressed storage and return the stored
/// name (the checksum). The original filename never becomes a path.
pub fn store_blob(dir: &Path, bytes: &[u8]) -> std::io::Result<String> {
    std::fs::create_dir_all(dir)?;
    let stored_name = sha256_hex(bytes);
    let dest = dir.join(&stored_name);
    if dest.exists() {
        debug!(stored_name = %stored_name, "blob already present, deduplicated");
        return Ok(stored_name);
    }
    std::fs::write(&dest, bytes)?;
    Ok(stored_name)
}

/// Read a stored blob back for download streaming.
pub fn load_blob(dir: &Path, stored_name: &str) -> Option<Vec<u8>> {
    // stored_name comes from our own database, but double-check it cannot
    // escape the transfer directory.
    if stored_name.contains('/') || stored_name.contains('\\') || stored_name.contains("..") {
        warn!(stored_name = %stored_name, "suspicious stored name rejected");
        return None;
    }
    std::fs::read(dir.join(stored_name)).ok()
}

/// Split raw bytes into base64 chunks for the wire.
pub fn encode_chunks(bytes: &[u8], chunk_size: usize) -> Vec<String> {
    bytes.chunks(chunk_size).map(|c| BASE64.encode(c)).collect()
}

/// Transfer directory derived from the database location.
pub fn default_transfer_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("transfers")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_simple(mgr: &mut TransferManager, size: u64, checksum: &str) -> String {
        mgr.begin("!r:lan", "alice", "notes.txt", size, checksum)
            .unwrap()
    }

    #[test]
    fn happy_path_verifies() {
        let data = b"hello world".to_vec();
        let checksum = sha256_hex(&data);
        let mut mgr = TransferManager::new();
        let tid = begin_simple(&mut mgr, data.len() as u64, &checksum);

        assert_eq!(
            mgr.append(&tid, "alice", &BASE64.encode(&data)),
            ChunkOutcome::Accepted
        );
        let transfer = mgr.finish(&tid, "alice").unwrap();
        assert_eq!(verify(&transfer).unwrap(), data.as_slice());
    }

    #[test]
    fn checksum_mismatch_is_discarded() {
        let mut mgr = TransferManager::new();
        let tid = begin_simple(&mut mgr, 4, &sha256_hex(b"good"));
        mgr.append(&tid, "alice", &BASE64.encode(b"evil"));
        let transfer = mgr.finish(&tid, "alice").unwrap();
        assert_eq!(verify(&transfer), Err(ErrorCode::FileError));
    }

    #[test]
    fn size_mismatch_is_discarded() {
        let mut mgr = TransferManager::new();
        let tid = begin_simple(&mut mgr, 100, "");
        mgr.append(&tid, "alice", &BASE64.encode(b"short"));
        let transfer = mgr.finish(&tid, "alice").unwrap();
        assert!(verify(&transfer).is_err());
    }

    #[test]
    fn declared_size_over_ceiling_is_refused() {
        let mut mgr = TransferManager::new();
        let result = mgr.begin("!r:lan", "alice", "big.bin", (MAX_FILE_BYTES + 1) as u64, "");
        assert_eq!(result.unwrap_err(), ErrorCode::TooLarge);
    }

    #[test]
    fn oversized_chunk_kills_transfer() {
        let mut mgr = TransferManager::new();
        let tid = begin_simple(&mut mgr, MAX_FILE_BYTES as u64, "");
        let big = vec![0u8; LAN_CHUNK_BYTES + 1];
        assert_eq!(
            mgr.append(&tid, "alice", &BASE64.encode(&big)),
            ChunkOutcome::Rejected(ErrorCode::FileError)
        );
        assert!(mgr.finish(&tid, "alice").is_none());
    }

    #[test]
    fn foreign_sender_is_ignored() {
        let mut mgr = TransferManager::new();
        let tid = begin_simple(&mut mgr, 4, "");
        assert_eq!(
            mgr.append(&tid, "mallory", &BASE64.encode(b"data")),
            ChunkOutcome::Ignored
        );
        assert!(mgr.finish(&tid, "mallory").is_none());
        // Still claimable by the real sender
        assert!(mgr.finish(&tid, "alice").is_some());
    }

    #[test]
    fn filename_is_reduced_to_base_name() {
        let mut mgr = TransferManager::new();
        let tid = mgr
            .begin("!r:lan", "alice", "../../etc/passwd", 1, "")
            .unwrap();
        let transfer = mgr.finish(&tid, "alice").unwrap();
        assert_eq!(transfer.filename, "passwd");
    }

    #[test]
    fn blob_storage_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let name = store_blob(dir.path(), b"payload").unwrap();
        assert_eq!(name, sha256_hex(b"payload"));
        assert_eq!(load_blob(dir.path(), &name).unwrap(), b"payload");
        assert!(load_blob(dir.path(), "../escape").is_none());
    }

    #[test]
    fn disconnect_aborts_in_flight_uploads() {
        let mut mgr = TransferManager::new();
        begin_simple(&mut mgr, 10, "");
        begin_simple(&mut mgr, 10, "");
        assert_eq!(mgr.in_flight(), 2);
        mgr.abort_for_sender("alice");
        assert_eq!(mgr.in_flight(), 0);
    }
}
