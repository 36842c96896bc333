use super::handlers::AppState;
use super::router::create_router;
use crate::config::ServerConfig;
use crate::persistence::{Recovered, recover};
use crate::replication::{MasterReplicator, ReplicationSupervisor};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running TideKV node: recovered state, background tasks and replication
pub struct Node {
    state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Recover local state and enter the configured role
    pub async fn start(config: &ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let Recovered {
            engine,
            checkpoint_seq,
            replayed,
        } = recover(
            config.kv_store.clone(),
            config.oplog.clone(),
            &config.persistence,
        )
        .await?;
        let engine = Arc::new(engine);
        info!(
            "Recovered {} key(s) (checkpoint seq {}, {} entries replayed)",
            engine.kv().stats().await.total_keys,
            checkpoint_seq,
            replayed
        );

        let mut tasks = vec![engine.kv().start_ttl_cleanup()];
        tasks.extend(engine.start_checkpointing(config.persistence.checkpoint_interval_secs));
        tasks.extend(engine.oplog().start_periodic_sync());

        let master = Arc::new(MasterReplicator::new(
            Arc::clone(&engine),
            config.replication.clone(),
        ));
        let replication = Arc::new(ReplicationSupervisor::new(
            Arc::clone(&engine),
            config.replication.clone(),
            master,
        ));
        replication.start().await?;

        Ok(Self {
            state: AppState::new(engine, replication),
            tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Serve until `signal` resolves, then shut the node down
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Listening on http://{}", listener.local_addr()?);
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await;

        self.shutdown().await?;
        served?;
        Ok(())
    }

    /// Stop replication and background tasks, then checkpoint
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Shutting down node...");
        self.state.replication.shutdown().await;

        for task in &self.tasks {
            task.abort();
        }

        if let Err(e) = self.state.engine.shutdown().await {
            warn!("Final checkpoint failed: {}", e);
            return Err(e.into());
        }
        info!("Node stopped");
        Ok(())
    }
}
