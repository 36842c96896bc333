use super::checkpoint::CheckpointManager;
use super::types::{PersistenceConfig, Result};
use crate::core::StoreEngine;
use crate::core::engine::apply_entry;
use crate::core::kv_store::KVStore;
use crate::core::types::KVConfig;
use crate::oplog::{OplogConfig, OplogStore, RangeRead};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of startup recovery
pub struct Recovered {
    pub engine: StoreEngine,
    /// Sequence covered by the loaded checkpoint (0 without one)
    pub checkpoint_seq: u64,
    /// Oplog entries replayed on top of the checkpoint
    pub replayed: usize,
}

/// Recover system state from the checkpoint and the oplog
///
/// 1. Open the oplog (torn tail records are truncated).
/// 2. Load the checkpoint, if any, into a fresh KV store.
/// 3. Replay every retained entry after the checkpoint.
///
/// When the oplog cannot continue from the checkpoint (different `log_id`,
/// missing entries, or a log shorter than the checkpoint) it is rebased at
/// the checkpoint position.
pub async fn recover(
    kv_config: KVConfig,
    oplog_config: OplogConfig,
    config: &PersistenceConfig,
) -> Result<Recovered> {
    info!("Starting recovery process...");

    let oplog = OplogStore::open(oplog_config).await?;
    let checkpoints = CheckpointManager::new(config);
    let kv = KVStore::new(kv_config);

    let (checkpoint_seq, replay_from) = match checkpoints.load().await? {
        Some(checkpoint) => {
            let info = oplog.info();
            let continuous = checkpoint.log_id == oplog.log_id()
                && info.oldest_available() <= checkpoint.seq + 1
                && info.last_seq >= checkpoint.seq;

            let seq = checkpoint.seq;
            if !continuous {
                warn!(
                    "Oplog {} (first={}, last={}) cannot continue checkpoint {} at seq {}, rebasing",
                    oplog.log_id(),
                    info.first_seq,
                    info.last_seq,
                    checkpoint.log_id,
                    seq
                );
                oplog.rebase(checkpoint.log_id.clone(), seq).await?;
            } else {
                oplog.mark_checkpoint(seq).await?;
            }

            kv.replace_all(checkpoint.records).await;
            (seq, seq + 1)
        }
        None => {
            let info = oplog.info();
            if info.oldest_available() > 1 {
                warn!(
                    "Oplog starts at seq {} but no checkpoint exists, starting a fresh log",
                    info.oldest_available()
                );
                oplog.rebase(Uuid::new_v4().to_string(), 0).await?;
            }
            info!("No checkpoint found, replaying the whole oplog");
            (0, 1)
        }
    };

    let mut replayed = 0;
    let mut next = replay_from;
    while let RangeRead::Entries(entries) = oplog.get_range(next, None)? {
        let Some(last) = entries.last() else {
            break;
        };
        next = last.seq + 1;
        for entry in &entries {
            apply_entry(&kv, entry).await;
        }
        replayed += entries.len();
    }

    info!(
        "Recovery complete: checkpoint_seq={}, replayed={}, keys={}, last_seq={}",
        checkpoint_seq,
        replayed,
        kv.stats().await.total_keys,
        oplog.info().last_seq
    );

    Ok(Recovered {
        engine: StoreEngine::new(kv, Arc::new(oplog), checkpoints),
        checkpoint_seq,
        replayed,
    })
}
