use super::types::{Checkpoint, PersistenceConfig, PersistenceError, Result};
use super::write_atomic;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHECKPOINT_MAGIC: &[u8; 8] = b"TIDECKP1";
const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + 4;

/// Reads and writes the single checkpoint file
///
/// Layout: magic (8 bytes) + crc32 of the body (4 bytes, LE) + bincode body.
/// The file is replaced atomically, so a crash leaves either the previous or
/// the new checkpoint in place.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            path: config.checkpoint_path.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably write `checkpoint`, replacing the previous one
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let body = bincode::serialize(checkpoint)?;
        let checksum = crc32fast::hash(&body);

        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(CHECKPOINT_MAGIC);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(&body);

        write_atomic(&self.path, &bytes).await?;

        info!(
            "Checkpoint written to {:?}: seq={}, keys={}, {} bytes",
            self.path,
            checkpoint.seq,
            checkpoint.records.len(),
            bytes.len()
        );
        Ok(())
    }

    /// Load the checkpoint, `None` when none has been written yet
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No checkpoint at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < HEADER_LEN || &bytes[..CHECKPOINT_MAGIC.len()] != CHECKPOINT_MAGIC {
            return Err(PersistenceError::CheckpointCorrupted(self.path.clone()));
        }

        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[CHECKPOINT_MAGIC.len()..HEADER_LEN]);
        let expected = u32::from_le_bytes(crc_bytes);

        let body = &bytes[HEADER_LEN..];
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(PersistenceError::ChecksumMismatch { expected, actual });
        }

        let checkpoint: Checkpoint = bincode::deserialize(body)?;
        info!(
            "Loaded checkpoint from {:?}: log_id={}, seq={}, keys={}",
            self.path,
            checkpoint.log_id,
            checkpoint.seq,
            checkpoint.records.len()
        );
        Ok(Some(checkpoint))
    }
}
