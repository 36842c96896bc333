// Master/slave replication tests with real nodes on local sockets


use serde_json::json;
use std::time::Duration;
use test_helper::{SYNC_TIMEOUT, TestServer, start_server};

async fn slaveof(slave: &TestServer, master: &TestServer) {
    assert_eq!(
        slave
            .ok("slaveof", json!({ "master": master.addr.to_string() }))
            .await,
        "OK"
    );
}

async fn get(server: &TestServer, key: &str) -> serde_json::Value {
    server.ok("kv.get", json!({ "key": key })).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slave_matches_master_after_slaveof() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master = start_server(master_dir.path(), 0).await;
    let slave = start_server(slave_dir.path(), 0).await;

    for i in 0..50 {
        master.set(&format!("key:{:02}", i), &format!("value-{}", i)).await;
    }
    master
        .ok("kv.expire", json!({ "key": "key:07", "ttl": 300 }))
        .await;
    master.ok("kv.del", json!({ "key": "key:10" })).await;

    slaveof(&slave, &master).await;
    let expected = master.all_keys().await;
    wait_until!(
        SYNC_TIMEOUT,
        "slave to match master",
        slave.all_keys().await == expected
    );

    assert_eq!(expected.len(), 49);
    for key in ["key:00", "key:07", "key:49"] {
        assert_eq!(get(&slave, key).await, get(&master, key).await);
    }
    let ttl = slave.ok("kv.ttl", json!({ "key": "key:07" })).await;
    assert!(ttl.as_i64().unwrap() > 290);
    assert_eq!(slave.ok("kv.ttl", json!({ "key": "key:00" })).await, -1);

    let info = slave.info().await;
    assert_eq!(info["role"], "slave");
    assert_eq!(info["read_only"], true);
    assert_eq!(info["oplog.log_id"], master.info().await["oplog.log_id"]);

    slave.stop().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_writes_and_deletes_propagate() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master = start_server(master_dir.path(), 0).await;
    let slave = start_server(slave_dir.path(), 0).await;

    master.set("before", "1").await;
    slaveof(&slave, &master).await;
    wait_until!(SYNC_TIMEOUT, "initial sync", get(&slave, "before").await == "1");

    master.set("after", "2").await;
    master.ok("kv.del", json!({ "key": "before" })).await;
    master
        .ok("kv.expire", json!({ "key": "after", "ttl": 60 }))
        .await;

    wait_until!(
        Duration::from_secs(1),
        "live entries",
        slave.info().await["oplog.last"] == 4
    );
    assert!(get(&slave, "before").await.is_null());
    assert_eq!(get(&slave, "after").await, "2");
    assert!(slave.ok("kv.ttl", json!({ "key": "after" })).await.as_i64().unwrap() > 55);

    // The slave mirrors the master's rows under the same numbers
    let master_rows = master.ok("getop", json!({ "seq": 2 })).await;
    let slave_rows = slave.ok("getop", json!({ "seq": 2 })).await;
    assert_eq!(master_rows, slave_rows);

    let master_info = master.info().await;
    assert_eq!(master_info["connected_slaves"], 1);

    slave.stop().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slave_rejects_writes_with_readonly() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master = start_server(master_dir.path(), 0).await;
    let slave = start_server(slave_dir.path(), 0).await;

    master.set("k", "v").await;
    slaveof(&slave, &master).await;
    wait_until!(SYNC_TIMEOUT, "sync", get(&slave, "k").await == "v");

    let writes = [
        ("kv.set", json!({ "key": "k", "value": "x" })),
        ("kv.expire", json!({ "key": "k", "ttl": 5 })),
        ("kv.del", json!({ "key": "k" })),
        ("kv.flushdb", json!({})),
    ];
    for (command, payload) in writes {
        let response = slave.command(command, payload).await;
        assert_eq!(response["success"], false, "{} succeeded on a slave", command);
        assert!(
            response["error"].as_str().unwrap().starts_with("READONLY"),
            "{}: {}",
            command,
            response["error"]
        );
    }
    assert_eq!(get(&slave, "k").await, "v");

    // Reads keep working
    assert_eq!(slave.ok("kv.ttl", json!({ "key": "k" })).await, -1);
    assert_eq!(slave.all_keys().await, vec!["k".to_string()]);

    slave.stop().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_master_restart_does_not_force_full_resync() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master = start_server(master_dir.path(), 0).await;
    let port = master.addr.port();
    let slave = start_server(slave_dir.path(), 0).await;

    master.set("a", "1").await;
    slaveof(&slave, &master).await;
    wait_until!(SYNC_TIMEOUT, "sync", get(&slave, "a").await == "1");
    assert_eq!(slave.info().await["repl.full_syncs"], 1);

    master.stop().await;
    // Slave data survives the outage
    assert_eq!(get(&slave, "a").await, "1");

    let master = start_server(master_dir.path(), port).await;
    master.set("b", "2").await;

    wait_until!(
        Duration::from_secs(5),
        "write after restart",
        get(&slave, "b").await == "2"
    );
    let info = slave.info().await;
    assert_eq!(info["repl.full_syncs"], 1);
    assert_eq!(info["oplog.last"], 2);
    assert!(info["repl.reconnects"].as_u64().unwrap() >= 1);

    slave.stop().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slave_restart_resumes_from_cursor() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master = start_server(master_dir.path(), 0).await;
    let slave = start_server(slave_dir.path(), 0).await;

    master.set("a", "1").await;
    slaveof(&slave, &master).await;
    wait_until!(SYNC_TIMEOUT, "sync", get(&slave, "a").await == "1");
    slave.stop().await;

    master.set("b", "2").await;
    master.set("c", "3").await;

    // Restarted without --slaveof; the persisted cursor names the master
    let slave = start_server(slave_dir.path(), 0).await;
    assert_eq!(slave.info().await["role"], "slave");
    wait_until!(SYNC_TIMEOUT, "catch up", get(&slave, "c").await == "3");

    let info = slave.info().await;
    assert_eq!(info["repl.full_syncs"], 0);
    assert_eq!(info["oplog.last"], 3);
    assert_eq!(slave.all_keys().await, vec!["a", "b", "c"]);

    slave.stop().await;
    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slaveof_no_one_promotes_to_master() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master = start_server(master_dir.path(), 0).await;
    let slave = start_server(slave_dir.path(), 0).await;

    master.set("a", "1").await;
    slaveof(&slave, &master).await;
    wait_until!(SYNC_TIMEOUT, "sync", get(&slave, "a").await == "1");
    let master_log_id = master.info().await["oplog.log_id"].clone();

    assert_eq!(
        slave.ok("slaveof", json!({ "master": "NO ONE" })).await,
        "OK"
    );
    let info = slave.info().await;
    assert_eq!(info["role"], "master");
    assert_eq!(info["read_only"], false);
    assert_ne!(info["oplog.log_id"], master_log_id);

    // Data is kept and numbering continues
    assert_eq!(get(&slave, "a").await, "1");
    slave.set("local", "x").await;
    assert_eq!(slave.info().await["oplog.last"], 2);

    // Master writes no longer arrive
    master.set("later", "y").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(get(&slave, "later").await.is_null());

    let response = slave
        .command("slaveof", json!({ "master": "not-an-address" }))
        .await;
    assert_eq!(response["success"], false);
    assert_eq!(slave.info().await["role"], "master");

    slave.stop().await;
    master.stop().await;
}
