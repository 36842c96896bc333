use super::sync::SnapshotMetadata;
use crate::core::types::KeyRecord;
use crate::oplog::OplogEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node role in replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts writes and serves replication sessions
    #[default]
    Master,
    /// Read-only mirror of an upstream master
    Slave,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }
}

/// Link state of the slave side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    /// Standalone, read-write
    #[default]
    Detached,
    /// Bound to a master, connecting or waiting for the initial sync
    Syncing,
    /// Live entries are flowing
    Streaming,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Detached => "detached",
            ReplicaState::Syncing => "syncing",
            ReplicaState::Streaming => "streaming",
        }
    }
}

/// Frames exchanged on a replication session (bincode over binary WebSocket messages)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationCommand {
    /// Slave -> master, first frame of a session
    Handshake {
        replica_id: String,
        log_id: Option<String>,
        last_applied_seq: Option<u64>,
    },

    /// Master -> slave, a snapshot of the whole state at `metadata.seq` follows
    FullSyncBegin { metadata: SnapshotMetadata },

    /// Master -> slave, the next slice of the snapshot
    FullSyncChunk { records: Vec<KeyRecord> },

    /// Master -> slave, snapshot complete; CRC32 over the encoded chunks
    FullSyncEnd { checksum: u32 },

    /// Master -> slave, the slave's history is valid; entries follow from `from_seq`
    Continue { log_id: String, from_seq: u64 },

    /// Master -> slave, contiguous ascending entries
    Entries { entries: Vec<OplogEntry> },

    /// Master -> slave, keeps the link alive and reports the master's position
    Heartbeat { last_seq: u64, timestamp: u64 },

    /// Slave -> master, last sequence applied locally
    Ack { seq: u64 },
}

impl ReplicationCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationCommand::Handshake { .. } => "handshake",
            ReplicationCommand::FullSyncBegin { .. } => "full_sync_begin",
            ReplicationCommand::FullSyncChunk { .. } => "full_sync_chunk",
            ReplicationCommand::FullSyncEnd { .. } => "full_sync_end",
            ReplicationCommand::Continue { .. } => "continue",
            ReplicationCommand::Entries { .. } => "entries",
            ReplicationCommand::Heartbeat { .. } => "heartbeat",
            ReplicationCommand::Ack { .. } => "ack",
        }
    }

    pub fn encode(&self) -> ReplicationResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ReplicationResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Slave-side replication statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationStats {
    pub state: ReplicaState,
    /// Upstream `host:port`
    pub master: Option<String>,
    pub log_id: Option<String>,
    pub last_applied_seq: u64,
    /// Master position from the latest heartbeat or batch
    pub master_last_seq: u64,
    pub lag_entries: u64,
    pub full_syncs: u64,
    pub entries_applied: u64,
    pub reconnects: u64,
    /// Epoch milliseconds of the latest heartbeat
    pub last_heartbeat_ms: u64,
    pub connected: bool,
}

/// A slave session as seen by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: String,
    /// Highest sequence shipped to the replica
    pub sent_seq: u64,
    /// Highest sequence the replica acknowledged
    pub acked_seq: u64,
    pub full_syncs: u64,
    pub connected_at_ms: u64,
    pub last_ack_ms: u64,
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid master address: {0}")]
    InvalidAddress(String),

    #[error("Local store error: {0}")]
    Local(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for ReplicationError {
    fn from(e: bincode::Error) -> Self {
        ReplicationError::SerializationError(e.to_string())
    }
}

impl From<crate::oplog::OplogError> for ReplicationError {
    fn from(e: crate::oplog::OplogError) -> Self {
        match e {
            crate::oplog::OplogError::SequenceGap { expected, actual } => {
                ReplicationError::SequenceGap { expected, actual }
            }
            other => ReplicationError::Local(other.to_string()),
        }
    }
}

impl From<crate::core::TideError> for ReplicationError {
    fn from(e: crate::core::TideError) -> Self {
        ReplicationError::Local(e.to_string())
    }
}

impl From<axum::Error> for ReplicationError {
    fn from(e: axum::Error) -> Self {
        ReplicationError::ConnectionFailed(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ReplicationError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ReplicationError::ConnectionFailed(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;
