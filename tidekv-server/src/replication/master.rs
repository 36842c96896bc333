use super::config::ReplicationConfig;
use super::sync::{entry_size, snapshot_frames, split_by_size};
use super::types::{ReplicaInfo, ReplicationCommand, ReplicationError, ReplicationResult};
use crate::core::StoreEngine;
use crate::core::types::now_ms;
use crate::oplog::{OplogError, OplogInfo, RangeRead};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// Whether a slave presenting `(log_id, last_applied_seq)` must be bootstrapped
/// from a snapshot instead of continuing from its own position
pub fn needs_full_sync(
    master_log_id: &str,
    info: OplogInfo,
    log_id: Option<&str>,
    last_applied_seq: Option<u64>,
) -> bool {
    match (log_id, last_applied_seq) {
        (Some(log_id), Some(last_applied)) => {
            log_id != master_log_id
                || last_applied + 1 < info.oldest_available()
                || last_applied > info.last_seq
        }
        _ => true,
    }
}

struct ReplicaConnection {
    session: u64,
    info: ReplicaInfo,
}

/// Master side of replication
///
/// Each slave gets its own session task:
/// - handshake, then a chunked full sync or `Continue`
/// - backlog shipped in `batch_size` pages, split further by `max_frame_bytes`
/// - afterwards it waits on the oplog watch channel and pushes new ranges
/// - heartbeats every `heartbeat_interval_ms`, acks tracked per replica
pub struct MasterReplicator {
    engine: Arc<StoreEngine>,
    config: ReplicationConfig,

    /// Connected replicas
    replicas: RwLock<HashMap<String, ReplicaConnection>>,
    next_session: AtomicU64,

    shutdown_tx: watch::Sender<bool>,
}

impl MasterReplicator {
    pub fn new(engine: Arc<StoreEngine>, config: ReplicationConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            config,
            replicas: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Serve one replication session until the slave leaves or the master shuts down
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();

        let handshake = match self.read_handshake(&mut receiver).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Rejecting replication session: {}", e);
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };
        let ReplicationCommand::Handshake {
            replica_id,
            log_id,
            last_applied_seq,
        } = handshake
        else {
            warn!("Replication session did not start with a handshake");
            let _ = sender.send(Message::Close(None)).await;
            return;
        };

        info!(
            "Replica {} connected (log_id={:?}, last_applied_seq={:?})",
            replica_id, log_id, last_applied_seq
        );

        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.replicas.write().insert(
            replica_id.clone(),
            ReplicaConnection {
                session,
                info: ReplicaInfo {
                    id: replica_id.clone(),
                    sent_seq: 0,
                    acked_seq: last_applied_seq.unwrap_or(0),
                    full_syncs: 0,
                    connected_at_ms: now_ms(),
                    last_ack_ms: 0,
                },
            },
        );

        match self
            .serve(
                &replica_id,
                &mut sender,
                &mut receiver,
                log_id,
                last_applied_seq,
            )
            .await
        {
            Ok(()) => info!("Replication session for {} closed", replica_id),
            Err(e) => warn!("Replication session for {} failed: {}", replica_id, e),
        }

        {
            let mut replicas = self.replicas.write();
            if replicas
                .get(&replica_id)
                .is_some_and(|conn| conn.session == session)
            {
                replicas.remove(&replica_id);
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        info!("Replica {} disconnected", replica_id);
    }

    /// Get list of connected replicas
    pub fn list_replicas(&self) -> Vec<ReplicaInfo> {
        let mut replicas: Vec<ReplicaInfo> = self
            .replicas
            .read()
            .values()
            .map(|conn| conn.info.clone())
            .collect();
        replicas.sort_by(|a, b| a.id.cmp(&b.id));
        replicas
    }

    pub fn connected_replicas(&self) -> usize {
        self.replicas.read().len()
    }

    /// Close every session at its next frame boundary
    pub fn shutdown(&self) {
        info!(
            "Closing {} replication session(s)",
            self.connected_replicas()
        );
        self.shutdown_tx.send_replace(true);
    }

    async fn read_handshake(&self, receiver: &mut WsReceiver) -> ReplicationResult<ReplicationCommand> {
        let frame = tokio::time::timeout(self.config.replica_timeout(), receiver.next())
            .await
            .map_err(|_| ReplicationError::Timeout("waiting for handshake".to_string()))?;

        match frame {
            Some(Ok(Message::Binary(data))) => ReplicationCommand::decode(&data),
            Some(Ok(other)) => Err(ReplicationError::Protocol(format!(
                "unexpected message before handshake: {:?}",
                other
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(ReplicationError::Closed),
        }
    }

    async fn serve(
        &self,
        replica_id: &str,
        sender: &mut WsSender,
        receiver: &mut WsReceiver,
        log_id: Option<String>,
        last_applied_seq: Option<u64>,
    ) -> ReplicationResult<()> {
        let oplog = Arc::clone(self.engine.oplog());
        let mut last_seq_rx = oplog.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let master_log_id = oplog.log_id();
        let (mut session_log_id, mut next_seq) = match last_applied_seq {
            Some(last_applied)
                if !needs_full_sync(
                    &master_log_id,
                    oplog.info(),
                    log_id.as_deref(),
                    last_applied_seq,
                ) =>
            {
                let from_seq = last_applied + 1;
                info!("Continuing replica {} from seq {}", replica_id, from_seq);
                send_frame(
                    sender,
                    &ReplicationCommand::Continue {
                        log_id: master_log_id.clone(),
                        from_seq,
                    },
                )
                .await?;
                (master_log_id, from_seq)
            }
            _ => self.send_full_sync(replica_id, sender).await?,
        };

        loop {
            // Ship everything that is already available
            loop {
                if oplog.log_id() != session_log_id {
                    info!("Log history changed, resyncing replica {}", replica_id);
                    (session_log_id, next_seq) = self.send_full_sync(replica_id, sender).await?;
                    continue;
                }

                match oplog.get_range(next_seq, Some(self.config.batch_size)) {
                    Ok(RangeRead::Entries(entries)) => {
                        if entries.is_empty() {
                            break;
                        }
                        let batches =
                            split_by_size(entries, self.config.max_frame_bytes, entry_size);
                        for entries in batches {
                            let Some(last) = entries.last().map(|entry| entry.seq) else {
                                continue;
                            };
                            debug!(
                                "Shipping {} entries ({}..={}) to {}",
                                entries.len(),
                                next_seq,
                                last,
                                replica_id
                            );
                            send_frame(sender, &ReplicationCommand::Entries { entries }).await?;
                            next_seq = last + 1;
                            self.record_sent(replica_id, last);
                        }
                    }
                    Ok(RangeRead::NoData) => break,
                    Err(OplogError::Unavailable { requested, oldest }) => {
                        warn!(
                            "Replica {} fell behind retention (needs {}, oldest {}), resyncing",
                            replica_id, requested, oldest
                        );
                        (session_log_id, next_seq) =
                            self.send_full_sync(replica_id, sender).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            tokio::select! {
                changed = last_seq_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }

                _ = heartbeat.tick() => {
                    let frame = ReplicationCommand::Heartbeat {
                        last_seq: oplog.info().last_seq,
                        timestamp: now_ms(),
                    };
                    send_frame(sender, &frame).await?;
                }

                _ = shutdown_rx.changed() => {
                    info!("Master shutting down, closing session for {}", replica_id);
                    return Ok(());
                }

                msg = receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match ReplicationCommand::decode(&data)? {
                        ReplicationCommand::Ack { seq } => self.record_ack(replica_id, seq),
                        other => {
                            return Err(ReplicationError::Protocol(format!(
                                "unexpected {} frame from replica",
                                other.name()
                            )));
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    /// Send a consistent snapshot, returning the session's new `(log_id, next_seq)`
    async fn send_full_sync(
        &self,
        replica_id: &str,
        sender: &mut WsSender,
    ) -> ReplicationResult<(String, u64)> {
        let snapshot = self.engine.snapshot().await;
        let log_id = snapshot.log_id.clone();
        let seq = snapshot.seq;
        let total_keys = snapshot.records.len();
        let frames = snapshot_frames(snapshot, self.config.max_frame_bytes)?;

        info!(
            "Full sync for replica {}: {} keys at seq {} in {} frames",
            replica_id,
            total_keys,
            seq,
            frames.len()
        );

        for frame in &frames {
            send_frame(sender, frame).await?;
        }

        if let Some(conn) = self.replicas.write().get_mut(replica_id) {
            conn.info.full_syncs += 1;
            conn.info.sent_seq = seq;
        }
        Ok((log_id, seq + 1))
    }

    fn record_sent(&self, replica_id: &str, seq: u64) {
        if let Some(conn) = self.replicas.write().get_mut(replica_id) {
            conn.info.sent_seq = seq;
        }
    }

    fn record_ack(&self, replica_id: &str, seq: u64) {
        debug!("Replica {} acked seq {}", replica_id, seq);
        if let Some(conn) = self.replicas.write().get_mut(replica_id) {
            conn.info.acked_seq = seq;
            conn.info.last_ack_ms = now_ms();
        }
    }
}

async fn send_frame(sender: &mut WsSender, frame: &ReplicationCommand) -> ReplicationResult<()> {
    let bytes = frame.encode()?;
    sender.send(Message::Binary(bytes.into())).await?;
    Ok(())
}
