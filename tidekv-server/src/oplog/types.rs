use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Canonical oplog verb. Reads are never logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OplogCommand {
    Set,
    Del,
}

impl OplogCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            OplogCommand::Set => "SET",
            OplogCommand::Del => "DEL",
        }
    }
}

impl fmt::Display for OplogCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sequenced, replayable mutation record
///
/// `expire_at_ms` is an absolute epoch-millisecond deadline (`0` = no expiry),
/// so replaying an entry later yields the same wall-clock expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub seq: u64,
    pub command: OplogCommand,
    pub key: String,
    pub value: String,
    pub expire_at_ms: u64,
}

impl OplogEntry {
    /// Row format used by `GETOP`: `[cmd, key, value, expire_ms]`, or `[cmd, key]` for DEL
    pub fn to_row(&self) -> Vec<String> {
        match self.command {
            OplogCommand::Set => vec![
                self.command.to_string(),
                self.key.clone(),
                self.value.clone(),
                self.expire_at_ms.to_string(),
            ],
            OplogCommand::Del => vec![self.command.to_string(), self.key.clone()],
        }
    }
}

/// An entry that has not been assigned a sequence number yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OplogDraft {
    pub command: OplogCommand,
    pub key: String,
    pub value: String,
    pub expire_at_ms: u64,
}

impl OplogDraft {
    pub fn set(key: impl Into<String>, value: impl Into<String>, expire_at_ms: u64) -> Self {
        Self {
            command: OplogCommand::Set,
            key: key.into(),
            value: value.into(),
            expire_at_ms,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            command: OplogCommand::Del,
            key: key.into(),
            value: String::new(),
            expire_at_ms: 0,
        }
    }

    pub fn into_entry(self, seq: u64) -> OplogEntry {
        OplogEntry {
            seq,
            command: self.command,
            key: self.key,
            value: self.value,
            expire_at_ms: self.expire_at_ms,
        }
    }
}

/// Retained range of the log
///
/// Both bounds are `0` for an empty log. `first_seq == 0` means nothing has
/// been trimmed, i.e. entries are available from sequence 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogInfo {
    pub first_seq: u64,
    pub last_seq: u64,
}

impl OplogInfo {
    /// Lowest sequence number a range read can start from
    pub fn oldest_available(&self) -> u64 {
        if self.first_seq == 0 { 1 } else { self.first_seq }
    }
}

/// Outcome of a successful range read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRead {
    Entries(Vec<OplogEntry>),
    /// The requested sequence has not been produced yet
    NoData,
}

/// Durability policy for appends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// fsync every append
    #[default]
    Always,
    /// flush every append, fsync at most every `fsync_interval_ms`
    Periodic,
    /// flush to the OS only
    Never,
}

/// Oplog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OplogConfig {
    /// Directory holding segment files and the meta file
    pub path: PathBuf,
    /// Records per segment file before rolling to a new one
    pub segment_max_entries: u64,
    /// Segments to retain (0 = unbounded); only checkpointed segments are dropped
    pub max_segments: usize,
    /// Page size used when a range read does not name a limit
    pub default_range_limit: usize,
    /// Hard cap on a single range read
    pub max_range_limit: usize,
    pub fsync_mode: FsyncMode,
    pub fsync_interval_ms: u64,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/oplog"),
            segment_max_entries: 65_536,
            max_segments: 16,
            default_range_limit: 1_000,
            max_range_limit: 10_000,
            fsync_mode: FsyncMode::Always,
            fsync_interval_ms: 1_000,
        }
    }
}

impl OplogConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.segment_max_entries == 0 {
            return Err("oplog.segment_max_entries must be greater than 0".to_string());
        }
        if self.default_range_limit == 0 || self.max_range_limit == 0 {
            return Err("oplog range limits must be greater than 0".to_string());
        }
        if self.default_range_limit > self.max_range_limit {
            return Err("oplog.default_range_limit exceeds oplog.max_range_limit".to_string());
        }
        Ok(())
    }
}

/// Oplog error types
#[derive(Debug, Error)]
pub enum OplogError {
    #[error("Range unavailable: requested {requested}, oldest retained {oldest}")]
    Unavailable { requested: u64, oldest: u64 },

    #[error("Sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    #[error("Oplog corrupted at {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for OplogError {
    fn from(e: bincode::Error) -> Self {
        OplogError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for OplogError {
    fn from(e: serde_json::Error) -> Self {
        OplogError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OplogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows() {
        let set = OplogDraft::set("k", "v", 42).into_entry(1);
        assert_eq!(set.to_row(), vec!["SET", "k", "v", "42"]);

        let del = OplogDraft::del("k").into_entry(2);
        assert_eq!(del.to_row(), vec!["DEL", "k"]);
    }

    #[test]
    fn test_oldest_available() {
        assert_eq!(OplogInfo::default().oldest_available(), 1);
        let trimmed = OplogInfo {
            first_seq: 40,
            last_seq: 90,
        };
        assert_eq!(trimmed.oldest_available(), 40);
    }

    #[test]
    fn test_config_validation() {
        assert!(OplogConfig::default().validate().is_ok());

        let mut config = OplogConfig::default();
        config.segment_max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = OplogConfig::default();
        config.default_range_limit = 20_000;
        assert!(config.validate().is_err());
    }
}
