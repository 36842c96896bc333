use super::types::ReplicationResult;
use crate::persistence::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Slave-side position in a master's log, persisted as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCursor {
    /// `host:port` of the master
    pub master: String,
    pub log_id: String,
    pub last_applied_seq: u64,
}

/// Loads and stores the cursor file
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cursor; an unreadable file is treated as no cursor
    pub async fn load(&self) -> Option<ReplicationCursor> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read replication cursor {:?}: {}", self.path, e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(cursor) => Some(cursor),
            Err(e) => {
                warn!("Ignoring malformed replication cursor {:?}: {}", self.path, e);
                None
            }
        }
    }

    pub async fn save(&self, cursor: &ReplicationCursor) -> ReplicationResult<()> {
        let bytes = serde_json::to_vec_pretty(cursor)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(
            "Replication cursor saved: master={}, seq={}",
            cursor.master, cursor.last_applied_seq
        );
        Ok(())
    }

    pub async fn clear(&self) -> ReplicationResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
