use super::*;
use crate::core::{StoreEngine, TideError};
use crate::oplog::{Mutation, OplogConfig, RangeRead};
use crate::persistence::{PersistenceConfig, recover};
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::routing::get;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn repl_config(dir: &Path) -> ReplicationConfig {
    ReplicationConfig {
        cursor_path: dir.join("cursor.json"),
        heartbeat_interval_ms: 100,
        reconnect_delay_ms: 50,
        max_reconnect_delay_ms: 200,
        replica_timeout_secs: 2,
        batch_size: 4,
        ..Default::default()
    }
}

async fn open_engine(dir: &Path) -> Arc<StoreEngine> {
    let oplog = OplogConfig {
        path: dir.join("oplog"),
        ..Default::default()
    };
    open_engine_with(dir, oplog).await
}

async fn open_engine_with(dir: &Path, oplog: OplogConfig) -> Arc<StoreEngine> {
    let persistence = PersistenceConfig {
        checkpoint_path: dir.join("checkpoint.bin"),
        checkpoint_interval_secs: 0,
    };
    let recovered = recover(Default::default(), oplog, &persistence)
        .await
        .unwrap();
    Arc::new(recovered.engine)
}

/// Serve `/replication/ws` for `engine` on an ephemeral port
async fn spawn_master(
    engine: &Arc<StoreEngine>,
    dir: &Path,
) -> (SocketAddr, Arc<MasterReplicator>) {
    spawn_master_with(engine, repl_config(dir)).await
}

async fn spawn_master_with(
    engine: &Arc<StoreEngine>,
    config: ReplicationConfig,
) -> (SocketAddr, Arc<MasterReplicator>) {
    let master = Arc::new(MasterReplicator::new(Arc::clone(engine), config));
    let session_master = Arc::clone(&master);
    let app = Router::new().route(
        "/replication/ws",
        get(move |ws: WebSocketUpgrade| {
            let master = Arc::clone(&session_master);
            async move { ws.on_upgrade(move |socket| master.handle_socket(socket)) }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, master)
}

fn slave_supervisor(engine: &Arc<StoreEngine>, dir: &Path) -> ReplicationSupervisor {
    slave_supervisor_with(engine, repl_config(dir))
}

fn slave_supervisor_with(
    engine: &Arc<StoreEngine>,
    config: ReplicationConfig,
) -> ReplicationSupervisor {
    let master = Arc::new(MasterReplicator::new(Arc::clone(engine), config.clone()));
    ReplicationSupervisor::new(Arc::clone(engine), config, master)
}

async fn set(engine: &StoreEngine, key: &str, value: &str) {
    engine
        .execute(Mutation::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .unwrap();
}

/// Poll `$cond` (which may `.await`) until it holds, failing after 5s
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

/// TCP relay in front of a master whose master-to-slave direction can be held
struct Relay {
    addr: SocketAddr,
    paused: watch::Sender<bool>,
}

impl Relay {
    async fn spawn(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (paused, pause_rx) = watch::channel(false);

        tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                let Ok(server) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let (mut client_read, mut client_write) = client.into_split();
                let (mut server_read, mut server_write) = server.into_split();

                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut client_read, &mut server_write).await;
                });

                let mut pause_rx = pause_rx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    loop {
                        if pause_rx.wait_for(|paused| !*paused).await.is_err() {
                            return;
                        }
                        let n = match server_read.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { addr, paused }
    }

    fn hold(&self) {
        self.paused.send_replace(true);
    }

    fn release(&self) {
        self.paused.send_replace(false);
    }
}

fn rows(engine: &StoreEngine) -> Vec<Vec<String>> {
    let oldest = engine.oplog_info().oldest_available();
    match engine.oplog().get_range(oldest, Some(10_000)).unwrap() {
        RangeRead::Entries(entries) => entries.iter().map(|e| e.to_row()).collect(),
        RangeRead::NoData => Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_sync_then_streaming() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine(master_dir.path()).await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let (addr, master) = spawn_master(&master_engine, master_dir.path()).await;

    for i in 0..10 {
        set(&master_engine, &format!("key_{}", i), &format!("value_{}", i)).await;
    }
    master_engine
        .execute(Mutation::Expire {
            key: "key_0".to_string(),
            ttl_secs: 100,
        })
        .await
        .unwrap();

    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.slaveof(&addr.to_string()).await.unwrap();

    wait_until!(
        "full sync",
        supervisor.state() == ReplicaState::Streaming
            && slave_engine.kv().keys().await.len() == 10
    );

    assert_eq!(slave_engine.kv().get("key_3").await.as_deref(), Some("value_3"));
    let ttl = slave_engine.kv().ttl("key_0").await;
    assert!(ttl > 95 && ttl <= 100, "ttl {}", ttl);
    assert_eq!(slave_engine.kv().ttl("key_1").await, -1);
    assert_eq!(slave_engine.oplog().log_id(), master_engine.oplog().log_id());
    assert_eq!(slave_engine.oplog_info().last_seq, 11);
    assert_eq!(supervisor.stats().full_syncs, 1);

    // Live writes keep the master's numbering
    set(&master_engine, "live", "1").await;
    master_engine
        .execute(Mutation::Del {
            key: "key_5".to_string(),
        })
        .await
        .unwrap();

    wait_until!("streamed entries", slave_engine.oplog_info().last_seq == 13);
    assert_eq!(slave_engine.kv().get("live").await.as_deref(), Some("1"));
    assert!(!slave_engine.kv().exists("key_5").await);

    let master_rows = rows(&master_engine);
    assert_eq!(&rows(&slave_engine)[..], &master_rows[11..]);
    assert_eq!(master_rows[12], vec!["DEL".to_string(), "key_5".to_string()]);

    wait_until!(
        "ack",
        master
            .list_replicas()
            .first()
            .is_some_and(|replica| replica.acked_seq == 13)
    );
    assert_eq!(master.connected_replicas(), 1);

    supervisor.shutdown().await;
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slave_rejects_writes() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine(master_dir.path()).await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let (addr, master) = spawn_master(&master_engine, master_dir.path()).await;

    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.slaveof(&addr.to_string()).await.unwrap();

    let mutations = vec![
        Mutation::Set {
            key: "k".into(),
            value: "v".into(),
        },
        Mutation::Expire {
            key: "k".into(),
            ttl_secs: 10,
        },
        Mutation::Del { key: "k".into() },
        Mutation::FlushDb,
    ];
    for mutation in mutations {
        assert!(matches!(
            slave_engine.execute(mutation).await,
            Err(TideError::ReadOnly)
        ));
    }

    supervisor.slaveof_no_one().await.unwrap();
    set(&slave_engine, "k", "v").await;
    assert_eq!(supervisor.role(), NodeRole::Master);

    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_resumes_from_cursor() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine(master_dir.path()).await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let (addr, master) = spawn_master(&master_engine, master_dir.path()).await;

    set(&master_engine, "a", "1").await;
    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.slaveof(&addr.to_string()).await.unwrap();
    wait_until!("initial sync", slave_engine.kv().exists("a").await);
    supervisor.shutdown().await;

    // Written while the slave is away
    set(&master_engine, "b", "2").await;
    set(&master_engine, "c", "3").await;

    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.role(), NodeRole::Slave);

    wait_until!("catch up", slave_engine.oplog_info().last_seq == 3);
    assert_eq!(slave_engine.kv().get("c").await.as_deref(), Some("3"));
    assert_eq!(supervisor.stats().full_syncs, 0);
    assert_eq!(supervisor.stats().entries_applied, 2);

    supervisor.shutdown().await;
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_foreign_history_forces_full_sync() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine(master_dir.path()).await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let (addr, master) = spawn_master(&master_engine, master_dir.path()).await;

    set(&master_engine, "shared", "master").await;
    // Local writes made while this node was still a master
    set(&slave_engine, "local_only", "x").await;
    set(&slave_engine, "shared", "local").await;

    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.slaveof(&addr.to_string()).await.unwrap();

    wait_until!("full sync", supervisor.state() == ReplicaState::Streaming);
    assert_eq!(slave_engine.kv().keys().await, vec!["shared".to_string()]);
    assert_eq!(
        slave_engine.kv().get("shared").await.as_deref(),
        Some("master")
    );
    assert_eq!(slave_engine.oplog().log_id(), master_engine.oplog().log_id());

    supervisor.shutdown().await;
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_sync_streams_in_chunks() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine(master_dir.path()).await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let config = ReplicationConfig {
        max_frame_bytes: 512,
        ..repl_config(master_dir.path())
    };
    let (addr, master) = spawn_master_with(&master_engine, config).await;

    let value = "x".repeat(100);
    for i in 0..40 {
        set(&master_engine, &format!("key_{:02}", i), &value).await;
    }

    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.slaveof(&addr.to_string()).await.unwrap();
    wait_until!(
        "chunked full sync",
        supervisor.state() == ReplicaState::Streaming
            && slave_engine.kv().keys().await.len() == 40
    );
    assert_eq!(
        slave_engine.kv().keys().await,
        master_engine.kv().keys().await
    );
    assert_eq!(slave_engine.kv().get("key_39").await.as_deref(), Some(value.as_str()));
    assert_eq!(slave_engine.oplog_info().last_seq, 40);

    // Batches above the frame budget are split as well
    for i in 0..10 {
        set(&master_engine, &format!("live_{}", i), &value).await;
    }
    wait_until!("live batches", slave_engine.oplog_info().last_seq == 50);
    assert_eq!(slave_engine.kv().keys().await.len(), 50);
    assert_eq!(supervisor.stats().full_syncs, 1);

    supervisor.shutdown().await;
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_sync_larger_than_one_websocket_frame() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine_with(
        master_dir.path(),
        OplogConfig {
            path: master_dir.path().join("oplog"),
            fsync_mode: crate::oplog::FsyncMode::Never,
            ..Default::default()
        },
    )
    .await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let (addr, master) = spawn_master(&master_engine, master_dir.path()).await;

    let value = "v".repeat(1 << 20);
    for i in 0..20 {
        set(&master_engine, &format!("big_{:02}", i), &value).await;
    }
    assert!(20 * value.len() > config::MAX_WS_FRAME_BYTES);

    let supervisor = slave_supervisor(&slave_engine, slave_dir.path());
    supervisor.slaveof(&addr.to_string()).await.unwrap();
    wait_until!(
        "large full sync",
        slave_engine.kv().keys().await.len() == 20
    );

    assert_eq!(slave_engine.oplog_info().last_seq, 20);
    assert_eq!(
        slave_engine.kv().get("big_07").await.map(|v| v.len()),
        Some(1 << 20)
    );
    let stats = supervisor.stats();
    assert_eq!(stats.full_syncs, 1);
    assert_eq!(stats.reconnects, 0);

    supervisor.shutdown().await;
    master.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_session_resyncs_after_trim() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_engine = open_engine_with(
        master_dir.path(),
        OplogConfig {
            path: master_dir.path().join("oplog"),
            segment_max_entries: 2,
            max_segments: 1,
            fsync_mode: crate::oplog::FsyncMode::Never,
            ..Default::default()
        },
    )
    .await;
    let slave_engine = open_engine(slave_dir.path()).await;
    let (addr, master) = spawn_master(&master_engine, master_dir.path()).await;
    let relay = Relay::spawn(addr).await;

    set(&master_engine, "first", "1").await;

    let supervisor = slave_supervisor_with(
        &slave_engine,
        ReplicationConfig {
            replica_timeout_secs: 30,
            ..repl_config(slave_dir.path())
        },
    );
    supervisor.slaveof(&relay.addr.to_string()).await.unwrap();
    wait_until!(
        "initial sync",
        supervisor.state() == ReplicaState::Streaming && slave_engine.kv().exists("first").await
    );
    assert_eq!(supervisor.stats().full_syncs, 1);

    // Stall the link until the master's socket buffers fill up
    relay.hold();
    let value = "p".repeat(512 * 1024);
    for i in 0..48 {
        set(&master_engine, &format!("bulk_{:02}", i), &value).await;
    }
    let last_seq = master_engine.checkpoint().await.unwrap();
    assert_eq!(last_seq, 49);

    let oldest = master_engine.oplog_info().oldest_available();
    assert!(oldest > 2, "nothing was trimmed");
    let sent_seq = master.list_replicas()[0].sent_seq;
    assert!(
        sent_seq + 1 < oldest,
        "session shipped up to {} before the trim at {}",
        sent_seq,
        oldest
    );

    relay.release();
    wait_until!(
        "resync after trim",
        supervisor.stats().full_syncs == 2 && slave_engine.oplog_info().last_seq == 49
    );
    assert_eq!(
        slave_engine.kv().keys().await,
        master_engine.kv().keys().await
    );
    assert_eq!(master.list_replicas()[0].full_syncs, 2);
    // Same connection throughout
    assert_eq!(supervisor.stats().reconnects, 0);

    // And streaming resumes on top of the new snapshot
    set(&master_engine, "after", "2").await;
    wait_until!("stream after resync", slave_engine.kv().exists("after").await);

    supervisor.shutdown().await;
    master.shutdown();
}
