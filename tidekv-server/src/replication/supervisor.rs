//! Role management - `SLAVEOF host:port` and `SLAVEOF NO ONE`
//!
//! Owns the single active slave task. Switching master stops the running
//! task at a frame boundary before the next one starts.
use super::config::{ReplicationConfig, parse_master_addr};
use super::cursor::CursorStore;
use super::master::MasterReplicator;
use super::replica::{SharedStats, SlaveReplicator};
use super::types::{NodeRole, ReplicaState, ReplicationError, ReplicationResult, ReplicationStats};
use crate::core::StoreEngine;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

struct ActiveSlave {
    master: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Replication supervisor
pub struct ReplicationSupervisor {
    engine: Arc<StoreEngine>,
    config: ReplicationConfig,
    master: Arc<MasterReplicator>,
    cursors: CursorStore,
    replica_id: String,
    stats: SharedStats,
    active: Mutex<Option<ActiveSlave>>,
}

impl ReplicationSupervisor {
    pub fn new(
        engine: Arc<StoreEngine>,
        config: ReplicationConfig,
        master: Arc<MasterReplicator>,
    ) -> Self {
        let cursors = CursorStore::new(config.cursor_path.clone());
        Self {
            engine,
            config,
            master,
            cursors,
            replica_id: Uuid::new_v4().to_string(),
            stats: Arc::new(RwLock::new(ReplicationStats::default())),
            active: Mutex::new(None),
        }
    }

    /// Re-enter slave mode from config or a persisted cursor
    pub async fn start(&self) -> ReplicationResult<()> {
        let target = match &self.config.master {
            Some(master) => Some(master.clone()),
            None => self.cursors.load().await.map(|cursor| cursor.master),
        };

        match target {
            Some(master) => {
                info!("Starting as slave of {}", master);
                self.slaveof(&master).await
            }
            None => {
                info!("Starting as master");
                Ok(())
            }
        }
    }

    /// Follow `addr`, replacing any current master
    pub async fn slaveof(&self, addr: &str) -> ReplicationResult<()> {
        let master = parse_master_addr(addr).map_err(ReplicationError::InvalidAddress)?;
        let mut active = self.active.lock().await;

        if active
            .as_ref()
            .is_some_and(|current| current.master == master && !current.handle.is_finished())
        {
            info!("Already replicating from {}", master);
            return Ok(());
        }

        if let Some(previous) = active.take() {
            info!("Switching master from {} to {}", previous.master, master);
            Self::stop(previous).await;
        }

        self.engine.set_read_only(true).await;
        *self.stats.write() = ReplicationStats {
            state: ReplicaState::Syncing,
            master: Some(master.clone()),
            ..Default::default()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let replicator = SlaveReplicator::new(
            Arc::clone(&self.engine),
            self.config.clone(),
            master.clone(),
            self.replica_id.clone(),
            Arc::clone(&self.stats),
        );
        let handle = tokio::spawn(replicator.run(shutdown_rx));

        info!("Replicating from {}", master);
        *active = Some(ActiveSlave {
            master,
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop replicating and accept writes again
    ///
    /// The local history is kept but gets a new log id, so slaves of the
    /// former master cannot resume against it by accident.
    pub async fn slaveof_no_one(&self) -> ReplicationResult<()> {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            info!("SLAVEOF NO ONE on a master, nothing to do");
            return Ok(());
        };

        Self::stop(previous).await;

        let log_id = self.engine.fork_history().await?;
        self.cursors.clear().await?;
        self.engine.set_read_only(false).await;
        *self.stats.write() = ReplicationStats::default();

        info!("Promoted to master (log_id={})", log_id);
        Ok(())
    }

    pub fn role(&self) -> NodeRole {
        match self.stats.read().state {
            ReplicaState::Detached => NodeRole::Master,
            ReplicaState::Syncing | ReplicaState::Streaming => NodeRole::Slave,
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.stats.read().state
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.read().clone()
    }

    pub fn master(&self) -> &Arc<MasterReplicator> {
        &self.master
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Stop the slave task and close every master session
    pub async fn shutdown(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            Self::stop(previous).await;
        }
        self.master.shutdown();
    }

    async fn stop(slave: ActiveSlave) {
        slave.shutdown_tx.send_replace(true);
        if let Err(e) = slave.handle.await {
            warn!("Replication task for {} ended abnormally: {}", slave.master, e);
        }
    }
}
