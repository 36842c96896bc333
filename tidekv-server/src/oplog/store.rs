use super::segment::{self, SegmentWriter};
use super::types::{
    FsyncMode, OplogConfig, OplogDraft, OplogEntry, OplogError, OplogInfo, RangeRead, Result,
};
use crate::persistence::write_atomic;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const META_FILE: &str = "meta.json";

/// Persisted identity of a log
///
/// `epoch` changes on every rebase so that segments of a previous history can
/// be told apart from the current ones. Entries `<= base_seq` are not part of
/// this log (they are covered by a checkpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OplogMeta {
    log_id: String,
    epoch: u64,
    base_seq: u64,
}

#[derive(Debug, Clone)]
struct SegmentMeta {
    first_seq: u64,
    /// Highest sequence stored in the segment (`first_seq - 1` while empty)
    last_seq: u64,
    path: PathBuf,
}

/// In-memory view of the retained range
struct RetainedLog {
    meta: OplogMeta,
    entries: VecDeque<Arc<OplogEntry>>,
    segments: VecDeque<SegmentMeta>,
    last_seq: u64,
    checkpoint_seq: u64,
}

impl RetainedLog {
    fn info(&self) -> OplogInfo {
        let first_seq = match self.entries.front() {
            Some(entry) if entry.seq == 1 => 0,
            Some(entry) => entry.seq,
            None if self.last_seq == 0 => 0,
            None => self.last_seq + 1,
        };

        OplogInfo {
            first_seq,
            last_seq: self.last_seq,
        }
    }
}

struct WriterState {
    active: SegmentWriter,
    last_fsync: Instant,
    /// Acknowledged records not yet forced to disk
    unsynced: bool,
}

/// Append-only, sequence-numbered operation log
///
/// - Sequence assignment is serialized by the writer lock
/// - Retained entries are kept in memory for range reads
/// - Records are durable (per `fsync_mode`) before they become visible
/// - Watchers are woken through a `watch` channel carrying `last_seq`
pub struct OplogStore {
    config: OplogConfig,
    dir: PathBuf,
    log: RwLock<RetainedLog>,
    writer: Mutex<WriterState>,
    last_seq_tx: watch::Sender<u64>,
}

impl OplogStore {
    /// Open the log at `config.path`, creating an empty one if needed
    pub async fn open(config: OplogConfig) -> Result<Self> {
        let dir = config.path.clone();
        tokio::fs::create_dir_all(&dir).await?;

        let meta = match Self::load_meta(&dir).await? {
            Some(meta) => meta,
            None => {
                let meta = OplogMeta {
                    log_id: Uuid::new_v4().to_string(),
                    epoch: 0,
                    base_seq: 0,
                };
                Self::store_meta(&dir, &meta).await?;
                info!("Created new oplog {} at {:?}", meta.log_id, dir);
                meta
            }
        };

        let mut files = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            let Some((epoch, first_seq)) = segment::parse_segment_file_name(&name) else {
                continue;
            };
            if epoch != meta.epoch {
                warn!("Removing stale oplog segment {:?} (epoch {})", name, epoch);
                tokio::fs::remove_file(item.path()).await?;
                continue;
            }
            files.push((first_seq, item.path()));
        }
        files.sort_by_key(|(first_seq, _)| *first_seq);

        let mut entries = VecDeque::new();
        let mut segments = VecDeque::new();
        let mut last_seq = meta.base_seq;
        let mut tail = None;
        let file_count = files.len();

        for (idx, (first_seq, path)) in files.into_iter().enumerate() {
            let is_tail = idx + 1 == file_count;

            if idx == 0 {
                if first_seq <= meta.base_seq {
                    return Err(OplogError::Corrupted {
                        path,
                        reason: format!(
                            "segment starts at {} but log base is {}",
                            first_seq, meta.base_seq
                        ),
                    });
                }
                last_seq = first_seq - 1;
            } else if first_seq != last_seq + 1 {
                return Err(OplogError::Corrupted {
                    path,
                    reason: format!("expected segment at {}, found {}", last_seq + 1, first_seq),
                });
            }

            let scan = segment::read_segment(&path).await?;
            if let Some(reason) = scan.torn {
                if !is_tail {
                    return Err(OplogError::Corrupted { path, reason });
                }
                warn!(
                    "Torn record at the tail of {:?} ({}), truncating to {} bytes",
                    path, reason, scan.valid_len
                );
            }

            let count = scan.entries.len() as u64;
            for entry in scan.entries {
                if entry.seq != last_seq + 1 {
                    return Err(OplogError::Corrupted {
                        path,
                        reason: format!("expected seq {}, found {}", last_seq + 1, entry.seq),
                    });
                }
                last_seq = entry.seq;
                entries.push_back(Arc::new(entry));
            }

            segments.push_back(SegmentMeta {
                first_seq,
                last_seq,
                path: path.clone(),
            });

            if is_tail {
                tail = Some((path, first_seq, count, scan.valid_len));
            }
        }

        let active = match tail {
            Some((path, first_seq, count, valid_len)) => {
                SegmentWriter::open(path, first_seq, count, valid_len).await?
            }
            None => {
                let active = SegmentWriter::create(&dir, meta.epoch, last_seq + 1).await?;
                segments.push_back(SegmentMeta {
                    first_seq: last_seq + 1,
                    last_seq,
                    path: active.path().to_path_buf(),
                });
                active
            }
        };

        let log = RetainedLog {
            meta,
            entries,
            segments,
            last_seq,
            checkpoint_seq: 0,
        };

        let info_snapshot = log.info();
        info!(
            "Oplog {} opened at {:?}: first={}, last={}, segments={}",
            log.meta.log_id,
            dir,
            info_snapshot.first_seq,
            info_snapshot.last_seq,
            log.segments.len()
        );

        let (last_seq_tx, _) = watch::channel(last_seq);

        Ok(Self {
            config,
            dir,
            log: RwLock::new(log),
            writer: Mutex::new(WriterState {
                active,
                last_fsync: Instant::now(),
                unsynced: false,
            }),
            last_seq_tx,
        })
    }

    /// Assign the next sequence number and durably append
    pub async fn append(&self, draft: OplogDraft) -> Result<OplogEntry> {
        let mut writer = self.writer.lock().await;
        let seq = self.log.read().last_seq + 1;
        let entry = draft.into_entry(seq);

        self.write_locked(&mut writer, &entry).await?;

        debug!("Oplog append: seq={}, cmd={}, key={}", seq, entry.command, entry.key);
        Ok(entry)
    }

    /// Mirror an entry sequenced by an upstream master
    ///
    /// Returns `false` when the entry is already present.
    pub async fn append_replicated(&self, entry: &OplogEntry) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        let last_seq = self.log.read().last_seq;

        if entry.seq <= last_seq {
            debug!("Skipping duplicate replicated entry {}", entry.seq);
            return Ok(false);
        }
        if entry.seq != last_seq + 1 {
            return Err(OplogError::SequenceGap {
                expected: last_seq + 1,
                actual: entry.seq,
            });
        }

        self.write_locked(&mut writer, entry).await?;
        Ok(true)
    }

    /// Read up to `limit` entries starting at `start_seq`
    pub fn get_range(&self, start_seq: u64, limit: Option<usize>) -> Result<RangeRead> {
        let log = self.log.read();
        let info = log.info();

        if start_seq > info.last_seq {
            return Ok(RangeRead::NoData);
        }

        let oldest = info.oldest_available();
        if start_seq < oldest {
            return Err(OplogError::Unavailable {
                requested: start_seq,
                oldest,
            });
        }

        let Some(front) = log.entries.front() else {
            return Ok(RangeRead::NoData);
        };
        let skip = (start_seq - front.seq) as usize;
        let entries: Vec<OplogEntry> = log
            .entries
            .range(skip..)
            .take(self.effective_limit(limit))
            .map(|entry| entry.as_ref().clone())
            .collect();

        Ok(RangeRead::Entries(entries))
    }

    /// Consistent `{first_seq, last_seq}` snapshot
    pub fn info(&self) -> OplogInfo {
        self.log.read().info()
    }

    pub fn log_id(&self) -> String {
        self.log.read().meta.log_id.clone()
    }

    /// Receiver that changes whenever `last_seq` moves
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.last_seq_tx.subscribe()
    }

    pub fn checkpoint_seq(&self) -> u64 {
        self.log.read().checkpoint_seq
    }

    pub fn segment_count(&self) -> usize {
        self.log.read().segments.len()
    }

    pub fn retained_len(&self) -> usize {
        self.log.read().entries.len()
    }

    /// Record that a checkpoint covers everything up to `seq`, then apply retention
    pub async fn mark_checkpoint(&self, seq: u64) -> Result<usize> {
        let _writer = self.writer.lock().await;
        {
            let mut log = self.log.write();
            if seq > log.checkpoint_seq {
                log.checkpoint_seq = seq;
            }
        }
        self.trim_locked().await
    }

    /// Drop the whole history and restart at `base_seq` under `log_id`
    pub async fn rebase(&self, log_id: String, base_seq: u64) -> Result<()> {
        let mut writer = self.writer.lock().await;

        let meta = {
            let log = self.log.read();
            OplogMeta {
                log_id,
                epoch: log.meta.epoch + 1,
                base_seq,
            }
        };
        Self::store_meta(&self.dir, &meta).await?;

        let active = SegmentWriter::create(&self.dir, meta.epoch, base_seq + 1).await?;
        let active_path = active.path().to_path_buf();
        writer.active = active;
        writer.unsynced = false;

        let stale: Vec<PathBuf> = {
            let mut log = self.log.write();
            let stale = log.segments.drain(..).map(|s| s.path).collect();
            log.entries.clear();
            log.segments.push_back(SegmentMeta {
                first_seq: base_seq + 1,
                last_seq: base_seq,
                path: active_path,
            });
            log.last_seq = base_seq;
            log.checkpoint_seq = base_seq;
            log.meta = meta;
            stale
        };

        for path in stale {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove rebased segment {:?}: {}", path, e);
            }
        }

        self.last_seq_tx.send_replace(base_seq);
        info!("Oplog rebased at seq {} (log_id={})", base_seq, self.log_id());
        Ok(())
    }

    /// Give the current history a new identity
    ///
    /// Used when a replica is promoted: its entries stay readable, but other
    /// replicas of the former master can no longer resume against it.
    pub async fn fork(&self, log_id: String) -> Result<()> {
        let _writer = self.writer.lock().await;
        let meta = {
            let log = self.log.read();
            OplogMeta {
                log_id,
                ..log.meta.clone()
            }
        };
        Self::store_meta(&self.dir, &meta).await?;
        info!("Oplog forked as {}", meta.log_id);
        self.log.write().meta = meta;
        Ok(())
    }

    /// Force buffered records to stable storage
    pub async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.active.sync().await?;
        writer.last_fsync = Instant::now();
        writer.unsynced = false;
        Ok(())
    }

    /// Sync only when some acknowledged record is still unsynced
    pub async fn sync_pending(&self) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        if !writer.unsynced {
            return Ok(false);
        }
        writer.active.sync().await?;
        writer.last_fsync = Instant::now();
        writer.unsynced = false;
        Ok(true)
    }

    pub async fn has_unsynced(&self) -> bool {
        self.writer.lock().await.unsynced
    }

    /// Background fsync tick for `FsyncMode::Periodic`
    ///
    /// Appends only sync when the interval has elapsed since the previous
    /// fsync, so the tail of a burst is picked up here.
    pub fn start_periodic_sync(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.fsync_mode != FsyncMode::Periodic {
            return None;
        }

        let interval_ms = self.config.fsync_interval_ms.max(1);
        info!("Starting oplog fsync task (interval={}ms)", interval_ms);
        let store = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                match store.sync_pending().await {
                    Ok(true) => debug!("Oplog synced by periodic tick"),
                    Ok(false) => {}
                    Err(e) => warn!("Periodic oplog fsync failed: {}", e),
                }
            }
        }))
    }

    fn effective_limit(&self, limit: Option<usize>) -> usize {
        limit
            .filter(|limit| *limit > 0)
            .unwrap_or(self.config.default_range_limit)
            .min(self.config.max_range_limit)
    }

    async fn write_locked(&self, writer: &mut WriterState, entry: &OplogEntry) -> Result<()> {
        if writer.active.entries() >= self.config.segment_max_entries {
            self.roll_segment(writer, entry.seq).await?;
        }

        let record = segment::encode_record(entry)?;
        let sync = match self.config.fsync_mode {
            FsyncMode::Always => true,
            FsyncMode::Periodic => {
                writer.last_fsync.elapsed() >= Duration::from_millis(self.config.fsync_interval_ms)
            }
            FsyncMode::Never => false,
        };

        if let Err(e) = writer.active.append(&record, sync).await {
            error!("Oplog append failed at seq {}: {}", entry.seq, e);
            if let Err(rollback_err) = writer.active.rollback().await {
                error!("Oplog rollback failed: {}", rollback_err);
            }
            return Err(e);
        }
        if sync {
            writer.last_fsync = Instant::now();
            writer.unsynced = false;
        } else {
            writer.unsynced = true;
        }

        {
            let mut log = self.log.write();
            if let Some(segment) = log.segments.back_mut() {
                segment.last_seq = entry.seq;
            }
            log.entries.push_back(Arc::new(entry.clone()));
            log.last_seq = entry.seq;
        }
        self.last_seq_tx.send_replace(entry.seq);

        Ok(())
    }

    async fn roll_segment(&self, writer: &mut WriterState, first_seq: u64) -> Result<()> {
        writer.active.sync().await?;

        let epoch = self.log.read().meta.epoch;
        let next = SegmentWriter::create(&self.dir, epoch, first_seq).await?;
        debug!(
            "Rolled oplog segment {:?} -> {:?}",
            writer.active.path(),
            next.path()
        );

        self.log.write().segments.push_back(SegmentMeta {
            first_seq,
            last_seq: first_seq - 1,
            path: next.path().to_path_buf(),
        });
        writer.active = next;
        writer.unsynced = false;

        self.trim_locked().await?;
        Ok(())
    }

    /// Drop the oldest checkpointed segments beyond `max_segments`.
    /// Caller holds the writer lock.
    async fn trim_locked(&self) -> Result<usize> {
        let max_segments = self.config.max_segments;
        if max_segments == 0 {
            return Ok(0);
        }

        let victims: Vec<SegmentMeta> = {
            let mut log = self.log.write();
            let checkpoint_seq = log.checkpoint_seq;
            let mut victims = Vec::new();

            while log.segments.len() > max_segments && log.segments.len() > 1 {
                let removable = log
                    .segments
                    .front()
                    .is_some_and(|s| s.last_seq <= checkpoint_seq);
                if !removable {
                    break;
                }
                if let Some(oldest) = log.segments.pop_front() {
                    while log
                        .entries
                        .front()
                        .is_some_and(|entry| entry.seq <= oldest.last_seq)
                    {
                        log.entries.pop_front();
                    }
                    victims.push(oldest);
                }
            }
            victims
        };

        for victim in &victims {
            if let Err(e) = tokio::fs::remove_file(&victim.path).await {
                warn!("Failed to remove trimmed segment {:?}: {}", victim.path, e);
            }
        }

        if !victims.is_empty() {
            info!(
                "Oplog retention dropped {} segment(s), first_seq is now {}",
                victims.len(),
                self.info().first_seq
            );
        }

        Ok(victims.len())
    }

    async fn load_meta(dir: &Path) -> Result<Option<OplogMeta>> {
        let path = dir.join(META_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_meta(dir: &Path, meta: &OplogMeta) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(meta)?;
        write_atomic(&dir.join(META_FILE), &bytes).await?;
        Ok(())
    }
}
