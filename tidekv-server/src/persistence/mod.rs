/// Persistence module for checkpoints and crash recovery
///
/// The oplog is the write-ahead record of every mutation. This module adds:
/// - Checkpoints: full state at an oplog sequence, allowing retention to drop
///   older segments
/// - Recovery: load the checkpoint, then replay the oplog tail on top of it
pub mod checkpoint;
pub mod recovery;
pub mod types;

pub use checkpoint::CheckpointManager;
pub use recovery::{Recovered, recover};
pub use types::{Checkpoint, PersistenceConfig, PersistenceError, Result};

use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Replace `path` with `bytes` through a synced temp file and a rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}
