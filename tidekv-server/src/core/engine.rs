use super::error::{Result, TideError};
use super::kv_store::KVStore;
use super::types::now_ms;
use crate::oplog::{
    CommandTranslator, Mutation, OplogCommand, OplogEntry, OplogError, OplogInfo, OplogStore,
};
use crate::persistence::{Checkpoint, CheckpointManager};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Apply one sequenced entry to the key space
pub(crate) async fn apply_entry(kv: &KVStore, entry: &OplogEntry) {
    match entry.command {
        OplogCommand::Set => {
            if entry.expire_at_ms != 0 && entry.expire_at_ms <= now_ms() {
                kv.delete(&entry.key).await;
            } else {
                kv.put(&entry.key, entry.value.clone(), entry.expire_at_ms)
                    .await;
            }
        }
        OplogCommand::Del => {
            kv.delete(&entry.key).await;
        }
    }
}

/// The single serialization point of a store
///
/// Every state change goes through the write gate:
/// - client mutations: translate, append to the oplog, apply
/// - replicated entries: mirror into the oplog, apply
/// - snapshot installs and checkpoints
///
/// Reads go straight to the KV store or the oplog.
pub struct StoreEngine {
    kv: KVStore,
    oplog: Arc<OplogStore>,
    checkpoints: CheckpointManager,
    gate: Mutex<()>,
    read_only: AtomicBool,
}

impl StoreEngine {
    pub fn new(kv: KVStore, oplog: Arc<OplogStore>, checkpoints: CheckpointManager) -> Self {
        Self {
            kv,
            oplog,
            checkpoints,
            gate: Mutex::new(()),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn kv(&self) -> &KVStore {
        &self.kv
    }

    pub fn oplog(&self) -> &Arc<OplogStore> {
        &self.oplog
    }

    pub fn oplog_info(&self) -> OplogInfo {
        self.oplog.info()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Toggle replica mode; takes the gate so no client write is half-applied
    pub async fn set_read_only(&self, read_only: bool) {
        let _gate = self.gate.lock().await;
        self.read_only.store(read_only, Ordering::SeqCst);
        info!("Store is now {}", if read_only { "read-only" } else { "writable" });
    }

    /// Execute a client mutation, returning the entries it produced
    pub async fn execute(&self, mutation: Mutation) -> Result<Vec<OplogEntry>> {
        let _gate = self.gate.lock().await;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(TideError::ReadOnly);
        }

        let drafts = CommandTranslator::translate(&self.kv, &mutation, now_ms()).await;
        for draft in drafts.iter().filter(|d| d.command == OplogCommand::Set) {
            self.kv.check_capacity(&draft.key, &draft.value)?;
        }

        let mut entries = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let entry = self.oplog.append(draft).await.map_err(|e| {
                error!("Failed to log {}: {}", mutation.name(), e);
                TideError::from(e)
            })?;
            apply_entry(&self.kv, &entry).await;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Mirror and apply an entry sequenced by the master
    ///
    /// Returns `false` for a duplicate, which leaves state untouched.
    pub async fn apply_replicated(&self, entry: &OplogEntry) -> std::result::Result<bool, OplogError> {
        let _gate = self.gate.lock().await;
        if !self.oplog.append_replicated(entry).await? {
            return Ok(false);
        }
        apply_entry(&self.kv, entry).await;
        debug!("Applied replicated entry {}", entry.seq);
        Ok(true)
    }

    /// Consistent full state paired with the oplog position it reflects
    pub async fn snapshot(&self) -> Checkpoint {
        let _gate = self.gate.lock().await;
        self.snapshot_locked().await
    }

    /// Replace the whole state with a master snapshot
    ///
    /// The checkpoint is written before the oplog is rebased, so a crash in
    /// between is repaired by recovery.
    pub async fn install_snapshot(&self, snapshot: Checkpoint) -> Result<()> {
        let _gate = self.gate.lock().await;

        self.checkpoints.save(&snapshot).await?;
        self.oplog
            .rebase(snapshot.log_id.clone(), snapshot.seq)
            .await?;

        info!(
            "Installing snapshot: log_id={}, seq={}, keys={}",
            snapshot.log_id,
            snapshot.seq,
            snapshot.records.len()
        );
        self.kv.replace_all(snapshot.records).await;
        Ok(())
    }

    /// Write a checkpoint and let oplog retention drop what it covers
    pub async fn checkpoint(&self) -> Result<u64> {
        let seq = {
            let _gate = self.gate.lock().await;
            let checkpoint = self.snapshot_locked().await;
            self.checkpoints.save(&checkpoint).await?;
            checkpoint.seq
        };

        let dropped = self.oplog.mark_checkpoint(seq).await?;
        debug!("Checkpoint at seq {} dropped {} segment(s)", seq, dropped);
        Ok(seq)
    }

    /// Detach this history from the former master under a new log id
    pub async fn fork_history(&self) -> Result<String> {
        let _gate = self.gate.lock().await;
        let log_id = uuid::Uuid::new_v4().to_string();
        self.oplog.fork(log_id.clone()).await?;
        Ok(log_id)
    }

    /// Start background checkpointing
    pub fn start_checkpointing(self: &Arc<Self>, interval_secs: u64) -> Option<tokio::task::JoinHandle<()>> {
        if interval_secs == 0 {
            info!("Periodic checkpoints disabled");
            return None;
        }

        info!("Starting checkpoint task (interval={}s)", interval_secs);
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;

            loop {
                interval.tick().await;
                if let Err(e) = engine.checkpoint().await {
                    warn!("Periodic checkpoint failed: {}", e);
                }
            }
        }))
    }

    /// Flush the oplog and write a final checkpoint
    pub async fn shutdown(&self) -> Result<()> {
        self.oplog.flush().await?;
        self.checkpoint().await?;
        Ok(())
    }

    async fn snapshot_locked(&self) -> Checkpoint {
        Checkpoint {
            log_id: self.oplog.log_id(),
            seq: self.oplog.info().last_seq,
            created_at_ms: now_ms(),
            records: self.kv.dump().await,
        }
    }
}
