use super::config::ReplicationConfig;
use super::cursor::{CursorStore, ReplicationCursor};
use super::sync::SnapshotAssembler;
use super::types::{
    ReplicaState, ReplicationCommand, ReplicationError, ReplicationResult, ReplicationStats,
};
use crate::core::StoreEngine;
use crate::core::types::now_ms;
use crate::oplog::OplogEntry;
use crate::persistence::Checkpoint;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

type MasterStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shared view of the slave link, read by `INFO` and the supervisor
pub type SharedStats = Arc<RwLock<ReplicationStats>>;

/// Slave side of replication
///
/// Runs one connect / sync / tail cycle after another until told to stop:
/// - the handshake carries the persisted cursor when it names this master
/// - a full sync is collected chunk by chunk, verified, then replaces local
///   state and rebases the oplog in one step
/// - entries are mirrored under the master's sequence numbers
/// - failures back off exponentially before the next attempt
///
/// The shutdown signal is only observed between frames, so an entry is
/// never half-applied.
pub struct SlaveReplicator {
    engine: Arc<StoreEngine>,
    config: ReplicationConfig,
    master: String,
    replica_id: String,
    cursors: CursorStore,
    stats: SharedStats,
}

impl SlaveReplicator {
    pub fn new(
        engine: Arc<StoreEngine>,
        config: ReplicationConfig,
        master: String,
        replica_id: String,
        stats: SharedStats,
    ) -> Self {
        let cursors = CursorStore::new(config.cursor_path.clone());
        Self {
            engine,
            config,
            master,
            replica_id,
            cursors,
            stats,
        }
    }

    /// Main replication loop - connect, sync, and receive updates
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ReplicaState::Syncing, false);
            info!("Connecting to master at {}", self.master);

            let mut established = false;
            match self.session(&mut shutdown, &mut established).await {
                Ok(()) => {
                    info!("Replication from {} stopped", self.master);
                    break;
                }
                Err(e) => {
                    warn!("Replication link to {} failed: {}", self.master, e);
                }
            }

            if established {
                attempt = 0;
            }
            self.set_state(ReplicaState::Syncing, false);
            self.stats.write().reconnects += 1;

            let delay = self.config.backoff(attempt);
            attempt = attempt.saturating_add(1);
            info!("Reconnecting to {} in {:?}", self.master, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.stats.write().connected = false;
    }

    /// One connection lifetime. `Ok` only when shutdown was requested.
    async fn session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        established: &mut bool,
    ) -> ReplicationResult<()> {
        let url = format!("ws://{}/replication/ws", self.master);
        let (mut stream, _) =
            tokio::time::timeout(self.config.connect_timeout(), connect_async(url.as_str()))
                .await
                .map_err(|_| ReplicationError::Timeout(format!("connecting to {}", url)))??;

        let handshake = self.handshake().await;
        debug!("Sending handshake: {:?}", handshake);
        send_frame(&mut stream, &handshake).await?;

        let mut pending: Option<SnapshotAssembler> = None;
        loop {
            let frame = tokio::select! {
                frame = tokio::time::timeout(self.config.replica_timeout(), stream.next()) => frame,
                _ = shutdown.changed() => {
                    let _ = stream.close(None).await;
                    return Ok(());
                }
            };

            let message = match frame {
                Err(_) => {
                    return Err(ReplicationError::Timeout(format!(
                        "no frame from master for {}s",
                        self.config.replica_timeout_secs
                    )));
                }
                Ok(None) => return Err(ReplicationError::Closed),
                Ok(Some(message)) => message?,
            };

            let command = match message {
                Message::Binary(data) => ReplicationCommand::decode(&data)?,
                Message::Close(_) => return Err(ReplicationError::Closed),
                Message::Ping(data) => {
                    stream.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };

            let continues_transfer = matches!(
                command,
                ReplicationCommand::FullSyncChunk { .. } | ReplicationCommand::FullSyncEnd { .. }
            );
            if pending.is_some() && !continues_transfer {
                return Err(ReplicationError::Protocol(format!(
                    "{} frame interrupted a full sync",
                    command.name()
                )));
            }

            match command {
                ReplicationCommand::FullSyncBegin { metadata } => {
                    info!(
                        "Receiving full sync from {}: {} keys at seq {}",
                        self.master, metadata.total_keys, metadata.seq
                    );
                    self.set_state(ReplicaState::Syncing, true);
                    pending = Some(SnapshotAssembler::new(metadata));
                }
                ReplicationCommand::FullSyncChunk { records } => match pending.as_mut() {
                    Some(assembler) => assembler.push(records)?,
                    None => {
                        return Err(ReplicationError::Protocol(
                            "snapshot chunk outside a full sync".to_string(),
                        ));
                    }
                },
                ReplicationCommand::FullSyncEnd { checksum } => {
                    let Some(assembler) = pending.take() else {
                        return Err(ReplicationError::Protocol(
                            "snapshot end outside a full sync".to_string(),
                        ));
                    };
                    self.install_full_sync(assembler.finish(checksum)?).await?;
                    *established = true;
                    self.set_state(ReplicaState::Streaming, true);
                }
                ReplicationCommand::Continue { log_id, from_seq } => {
                    let local_last = self.engine.oplog_info().last_seq;
                    if log_id != self.engine.oplog().log_id() || from_seq != local_last + 1 {
                        return Err(ReplicationError::Protocol(format!(
                            "master continues {} at {}, local log is {} at {}",
                            log_id,
                            from_seq,
                            self.engine.oplog().log_id(),
                            local_last
                        )));
                    }
                    info!("Resuming replication from seq {}", from_seq);
                    self.save_cursor().await?;
                    *established = true;
                    self.set_state(ReplicaState::Streaming, true);
                }
                ReplicationCommand::Entries { entries } => {
                    let last = self.apply_entries(&entries).await?;
                    send_frame(&mut stream, &ReplicationCommand::Ack { seq: last }).await?;
                }
                ReplicationCommand::Heartbeat { last_seq, .. } => {
                    debug!("Heartbeat received, master last_seq: {}", last_seq);
                    let local_last = self.engine.oplog_info().last_seq;
                    let mut stats = self.stats.write();
                    stats.master_last_seq = last_seq;
                    stats.lag_entries = last_seq.saturating_sub(local_last);
                    stats.last_heartbeat_ms = now_ms();
                }
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "unexpected {} frame from master",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Build the handshake from the cursor, if it still describes the local log
    async fn handshake(&self) -> ReplicationCommand {
        let local_log_id = self.engine.oplog().log_id();
        let cursor = self
            .cursors
            .load()
            .await
            .filter(|cursor| cursor.master == self.master && cursor.log_id == local_log_id);

        match cursor {
            Some(cursor) => ReplicationCommand::Handshake {
                replica_id: self.replica_id.clone(),
                log_id: Some(cursor.log_id),
                last_applied_seq: Some(self.engine.oplog_info().last_seq),
            },
            None => ReplicationCommand::Handshake {
                replica_id: self.replica_id.clone(),
                log_id: None,
                last_applied_seq: None,
            },
        }
    }

    async fn install_full_sync(&self, snapshot: Checkpoint) -> ReplicationResult<()> {
        let seq = snapshot.seq;
        self.engine.install_snapshot(snapshot).await?;
        self.save_cursor().await?;

        let mut stats = self.stats.write();
        stats.full_syncs += 1;
        stats.master_last_seq = stats.master_last_seq.max(seq);
        info!("Full sync complete at seq {}", seq);
        Ok(())
    }

    /// Apply a batch in order, returning the last sequence now present locally
    async fn apply_entries(&self, entries: &[OplogEntry]) -> ReplicationResult<u64> {
        let mut applied = 0;
        for entry in entries {
            match self.engine.apply_replicated(entry).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to apply replicated entry {}: {}", entry.seq, e);
                    return Err(e.into());
                }
            }
        }

        let last = self.save_cursor().await?;
        let mut stats = self.stats.write();
        stats.entries_applied += applied;
        stats.master_last_seq = stats.master_last_seq.max(last);
        stats.lag_entries = stats.master_last_seq.saturating_sub(last);
        Ok(last)
    }

    async fn save_cursor(&self) -> ReplicationResult<u64> {
        let last_applied_seq = self.engine.oplog_info().last_seq;
        let log_id = self.engine.oplog().log_id();

        self.cursors
            .save(&ReplicationCursor {
                master: self.master.clone(),
                log_id: log_id.clone(),
                last_applied_seq,
            })
            .await?;

        let mut stats = self.stats.write();
        stats.last_applied_seq = last_applied_seq;
        stats.log_id = Some(log_id);
        Ok(last_applied_seq)
    }

    fn set_state(&self, state: ReplicaState, connected: bool) {
        let mut stats = self.stats.write();
        if stats.state != state {
            info!("Replication state: {} -> {}", stats.state.as_str(), state.as_str());
        }
        stats.state = state;
        stats.connected = connected;
        stats.master = Some(self.master.clone());
    }
}

async fn send_frame(stream: &mut MasterStream, frame: &ReplicationCommand) -> ReplicationResult<()> {
    let bytes = frame.encode()?;
    stream.send(Message::Binary(bytes.into())).await?;
    Ok(())
}
