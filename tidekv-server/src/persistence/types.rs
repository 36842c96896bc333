use crate::core::types::KeyRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Persistence error types
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Checkpoint corrupted: {0:?}")]
    CheckpointCorrupted(PathBuf),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),
}

impl From<bincode::Error> for PersistenceError {
    fn from(e: bincode::Error) -> Self {
        PersistenceError::SerializationError(e.to_string())
    }
}

impl From<crate::oplog::OplogError> for PersistenceError {
    fn from(e: crate::oplog::OplogError) -> Self {
        PersistenceError::RecoveryFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Full store state at an oplog position
///
/// Every oplog entry `<= seq` of log `log_id` is reflected in `records`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub log_id: String,
    pub seq: u64,
    pub created_at_ms: u64,
    pub records: Vec<KeyRecord>,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Checkpoint file location
    pub checkpoint_path: PathBuf,
    /// Seconds between periodic checkpoints (0 = only on shutdown and full sync)
    pub checkpoint_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("data/checkpoint.bin"),
            checkpoint_interval_secs: 60,
        }
    }
}
