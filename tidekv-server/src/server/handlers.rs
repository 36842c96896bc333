use crate::core::{StoreEngine, TideError};
use crate::oplog::{Mutation, RangeRead};
use crate::protocol::{Request, Response};
use crate::replication::ReplicationSupervisor;
use axum::{
    Json,
    extract::{
        Path, Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Default page size for `kv.scan`
const DEFAULT_SCAN_COUNT: usize = 10;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StoreEngine>,
    pub replication: Arc<ReplicationSupervisor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<StoreEngine>, replication: Arc<ReplicationSupervisor>) -> Self {
        Self {
            engine,
            replication,
            started_at: Instant::now(),
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "tidekv",
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.replication.role().as_str(),
    }))
}

/// `GET /info`
pub async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(info_map(&state).await)
}

#[derive(Debug, Deserialize)]
pub struct OplogQuery {
    pub limit: Option<usize>,
}

/// `GET /oplog/{seq}?limit=` - same semantics as the `getop` command
pub async fn get_oplog(
    State(state): State<AppState>,
    Path(seq): Path<u64>,
    Query(query): Query<OplogQuery>,
) -> Result<Json<serde_json::Value>, TideError> {
    Ok(Json(read_oplog(&state, seq, query.limit)?))
}

/// `GET /replication/ws` - a slave opening a replication session
pub async fn replication_websocket(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let master = Arc::clone(state.replication.master());
    ws.on_upgrade(move |socket: WebSocket| master.handle_socket(socket))
}

// ==================== StreamableHTTP Command Handler ====================

/// `POST /api/v1/command`
pub async fn command_handler(
    State(state): State<AppState>,
    Json(request): Json<Request>,
) -> Result<Json<Response>, TideError> {
    debug!(
        "Command: {} (request_id={})",
        request.command, request.request_id
    );

    let response = handle_command(state, request).await?;
    Ok(Json(response))
}

/// Handle individual commands
async fn handle_command(state: AppState, request: Request) -> Result<Response, TideError> {
    let request_id = request.request_id.clone();

    let result = match request.command.as_str() {
        "kv.set" => handle_kv_set_cmd(&state, &request).await,
        "kv.get" => handle_kv_get_cmd(&state, &request).await,
        "kv.del" => handle_kv_del_cmd(&state, &request).await,
        "kv.expire" => handle_kv_expire_cmd(&state, &request).await,
        "kv.ttl" => handle_kv_ttl_cmd(&state, &request).await,
        "kv.scan" => handle_kv_scan_cmd(&state, &request).await,
        "kv.flushdb" => handle_kv_flushdb_cmd(&state).await,
        "info" => Ok(info_map(&state).await),
        "getop" => handle_getop_cmd(&state, &request),
        "slaveof" => handle_slaveof_cmd(&state, &request).await,
        _ => Err(TideError::UnknownCommand(request.command.clone())),
    };

    match result {
        Ok(payload) => Ok(Response::success(request_id, payload)),
        Err(e) => {
            error!("Command {} failed: {}", request.command, e);
            Ok(Response::error(request_id, e.to_string()))
        }
    }
}

async fn handle_kv_set_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let key = request.str_field("key")?;
    let value = match request.payload.get("value") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => {
            return Err(TideError::InvalidRequest("Missing 'value' field".to_string()));
        }
        Some(other) => serde_json::to_string(other)
            .map_err(|e| TideError::SerializationError(e.to_string()))?,
    };

    state
        .engine
        .execute(Mutation::Set {
            key: key.to_string(),
            value,
        })
        .await?;
    Ok(json!("OK"))
}

async fn handle_kv_get_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let key = request.str_field("key")?;
    Ok(state
        .engine
        .kv()
        .get(key)
        .await
        .map(serde_json::Value::String)
        .unwrap_or(serde_json::Value::Null))
}

async fn handle_kv_del_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let key = request.str_field("key")?;
    let entries = state
        .engine
        .execute(Mutation::Del {
            key: key.to_string(),
        })
        .await?;
    Ok(json!({ "deleted": !entries.is_empty() }))
}

async fn handle_kv_expire_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let key = request.str_field("key")?;
    let ttl_secs = request.i64_field("ttl")?;

    let entries = state
        .engine
        .execute(Mutation::Expire {
            key: key.to_string(),
            ttl_secs,
        })
        .await?;
    Ok(json!(if entries.is_empty() { 0 } else { 1 }))
}

async fn handle_kv_ttl_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let key = request.str_field("key")?;
    Ok(json!(state.engine.kv().ttl(key).await))
}

async fn handle_kv_scan_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let cursor = request.opt_i64_field("cursor")?.unwrap_or(0);
    let count = request
        .opt_i64_field("count")?
        .unwrap_or(DEFAULT_SCAN_COUNT as i64);
    if cursor < 0 || count <= 0 {
        return Err(TideError::InvalidValue(
            "cursor must be >= 0 and count > 0".to_string(),
        ));
    }
    let prefix = request.payload.get("prefix").and_then(|v| v.as_str());

    let (next, keys) = state
        .engine
        .kv()
        .scan(cursor as u64, count as usize, prefix)
        .await;
    Ok(json!({
        "cursor": next.to_string(),
        "keys": keys,
    }))
}

async fn handle_kv_flushdb_cmd(state: &AppState) -> Result<serde_json::Value, TideError> {
    let entries = state.engine.execute(Mutation::FlushDb).await?;
    info!("FLUSHDB removed {} key(s)", entries.len());
    Ok(json!("OK"))
}

fn handle_getop_cmd(state: &AppState, request: &Request) -> Result<serde_json::Value, TideError> {
    let seq = u64::try_from(request.i64_field("seq")?)
        .map_err(|_| TideError::InvalidRequest("seq must be >= 1".to_string()))?;
    let limit = match request.opt_i64_field("limit")? {
        Some(limit) if limit < 1 => {
            return Err(TideError::InvalidValue("limit must be >= 1".to_string()));
        }
        limit => limit.map(|l| l as usize),
    };

    read_oplog(state, seq, limit)
}

async fn handle_slaveof_cmd(
    state: &AppState,
    request: &Request,
) -> Result<serde_json::Value, TideError> {
    let master = request.str_field("master")?;

    if is_no_one(master) {
        state.replication.slaveof_no_one().await?;
    } else {
        state.replication.slaveof(master).await?;
    }
    Ok(json!("OK"))
}

/// `getop` rows, or `null` when `seq` is past the end of the log
fn read_oplog(
    state: &AppState,
    seq: u64,
    limit: Option<usize>,
) -> Result<serde_json::Value, TideError> {
    if seq == 0 {
        return Err(TideError::InvalidRequest("seq must be >= 1".to_string()));
    }

    match state.engine.oplog().get_range(seq, limit)? {
        RangeRead::NoData => Ok(serde_json::Value::Null),
        RangeRead::Entries(entries) => {
            let rows: Vec<Vec<String>> = entries.iter().map(|entry| entry.to_row()).collect();
            Ok(json!(rows))
        }
    }
}

fn is_no_one(master: &str) -> bool {
    master
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .eq(["no", "one"])
}

/// Flat `INFO` map
async fn info_map(state: &AppState) -> serde_json::Value {
    let oplog = state.engine.oplog();
    let oplog_info = oplog.info();
    let kv_stats = state.engine.kv().stats().await;
    let repl = state.replication.stats();

    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "role": state.replication.role().as_str(),
        "read_only": state.engine.is_read_only(),
        "keys": kv_stats.total_keys,
        "used_memory": kv_stats.total_memory_bytes,
        "oplog.first": oplog_info.first_seq,
        "oplog.last": oplog_info.last_seq,
        "oplog.log_id": oplog.log_id(),
        "oplog.segments": oplog.segment_count(),
        "oplog.checkpoint_seq": oplog.checkpoint_seq(),
        "repl.replica_id": state.replication.replica_id(),
        "repl.state": repl.state.as_str(),
        "repl.master": repl.master,
        "repl.connected": repl.connected,
        "repl.last_applied_seq": repl.last_applied_seq,
        "repl.master_last_seq": repl.master_last_seq,
        "repl.lag": repl.lag_entries,
        "repl.full_syncs": repl.full_syncs,
        "repl.entries_applied": repl.entries_applied,
        "repl.reconnects": repl.reconnects,
        "repl.last_heartbeat_ms": repl.last_heartbeat_ms,
        "connected_slaves": state.replication.master().connected_replicas(),
        "slaves": state.replication.master().list_replicas(),
    })
}
