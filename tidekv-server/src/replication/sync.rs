//! Snapshot transfer for full synchronization
//!
//! A snapshot travels as a run of frames on the replication session:
//! `FullSyncBegin` (metadata), any number of `FullSyncChunk`s and a closing
//! `FullSyncEnd` carrying a CRC32 over the bincode encoding of every chunk.
//! Chunks are sized so that no single frame exceeds `max_frame_bytes`; the
//! slave only installs once the whole transfer is verified.

use crate::core::types::KeyRecord;
use crate::oplog::OplogEntry;
use crate::persistence::Checkpoint;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::{ReplicationCommand, ReplicationError, ReplicationResult};

/// Fixed per-string and per-record overhead of the bincode encoding
const RECORD_OVERHEAD: usize = 24;
const ENTRY_OVERHEAD: usize = 36;

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub log_id: String,
    pub seq: u64,
    pub created_at_ms: u64,
    pub total_keys: u64,
}

pub fn record_size(record: &KeyRecord) -> usize {
    record.key.len() + record.value.len() + RECORD_OVERHEAD
}

pub fn entry_size(entry: &OplogEntry) -> usize {
    entry.key.len() + entry.value.len() + ENTRY_OVERHEAD
}

/// Group `items` in order so each group stays under `max_bytes`
///
/// An item larger than `max_bytes` gets a group of its own.
pub fn split_by_size<T>(
    items: Vec<T>,
    max_bytes: usize,
    size_of: impl Fn(&T) -> usize,
) -> Vec<Vec<T>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for item in items {
        let size = size_of(&item);
        if !current.is_empty() && current_bytes + size > max_bytes {
            groups.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Turn a consistent store snapshot into the frames of one full sync
pub fn snapshot_frames(
    snapshot: Checkpoint,
    max_frame_bytes: usize,
) -> ReplicationResult<Vec<ReplicationCommand>> {
    let metadata = SnapshotMetadata {
        log_id: snapshot.log_id,
        seq: snapshot.seq,
        created_at_ms: snapshot.created_at_ms,
        total_keys: snapshot.records.len() as u64,
    };

    let chunks = split_by_size(snapshot.records, max_frame_bytes, record_size);
    let mut hasher = crc32fast::Hasher::new();
    let mut frames = Vec::with_capacity(chunks.len() + 2);
    frames.push(ReplicationCommand::FullSyncBegin {
        metadata: metadata.clone(),
    });
    for records in chunks {
        hasher.update(&bincode::serialize(&records)?);
        frames.push(ReplicationCommand::FullSyncChunk { records });
    }
    let checksum = hasher.finalize();
    frames.push(ReplicationCommand::FullSyncEnd { checksum });

    info!(
        "Snapshot prepared: {} keys at seq {} in {} chunk(s), checksum: {}",
        metadata.total_keys,
        metadata.seq,
        frames.len() - 2,
        checksum
    );
    Ok(frames)
}

/// Slave-side collector for an in-flight full sync
pub struct SnapshotAssembler {
    metadata: SnapshotMetadata,
    records: Vec<KeyRecord>,
    hasher: crc32fast::Hasher,
    chunks: usize,
}

impl SnapshotAssembler {
    pub fn new(metadata: SnapshotMetadata) -> Self {
        Self {
            records: Vec::with_capacity(metadata.total_keys.min(1 << 20) as usize),
            metadata,
            hasher: crc32fast::Hasher::new(),
            chunks: 0,
        }
    }

    pub fn push(&mut self, records: Vec<KeyRecord>) -> ReplicationResult<()> {
        let received = self.records.len() as u64 + records.len() as u64;
        if received > self.metadata.total_keys {
            return Err(ReplicationError::SerializationError(format!(
                "snapshot announced {} keys, received at least {}",
                self.metadata.total_keys, received
            )));
        }

        self.hasher.update(&bincode::serialize(&records)?);
        self.records.extend(records);
        self.chunks += 1;
        debug!(
            "Snapshot chunk {} received ({}/{} keys)",
            self.chunks,
            self.records.len(),
            self.metadata.total_keys
        );
        Ok(())
    }

    /// Verify the transfer and hand back the complete snapshot
    pub fn finish(self, checksum: u32) -> ReplicationResult<Checkpoint> {
        let actual = self.hasher.finalize();
        if actual != checksum {
            return Err(ReplicationError::SerializationError(format!(
                "Checksum mismatch: expected {}, got {}",
                checksum, actual
            )));
        }
        if self.records.len() as u64 != self.metadata.total_keys {
            return Err(ReplicationError::SerializationError(format!(
                "snapshot announced {} keys, carried {}",
                self.metadata.total_keys,
                self.records.len()
            )));
        }

        Ok(Checkpoint {
            log_id: self.metadata.log_id,
            seq: self.metadata.seq,
            created_at_ms: self.metadata.created_at_ms,
            records: self.records,
        })
    }
}
