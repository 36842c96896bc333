use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest frame the WebSocket client accepts by default
pub const MAX_WS_FRAME_BYTES: usize = 16 << 20;

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Master to follow on startup (`host:port`), standalone when unset
    pub master: Option<String>,

    /// Where the slave persists its replication cursor
    pub cursor_path: PathBuf,

    /// Connect attempt timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// First reconnect delay in milliseconds (doubles on every failure)
    pub reconnect_delay_ms: u64,

    /// Upper bound of the reconnect delay
    pub max_reconnect_delay_ms: u64,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Link is considered dead after this many seconds without a frame
    pub replica_timeout_secs: u64,

    /// Maximum entries per shipped batch
    pub batch_size: usize,

    /// Soft cap on the payload of one frame; snapshots and large batches are split
    pub max_frame_bytes: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            master: None,
            cursor_path: PathBuf::from("data/replication_cursor.json"),
            connect_timeout_ms: 1000,
            reconnect_delay_ms: 200,
            max_reconnect_delay_ms: 5000,
            heartbeat_interval_ms: 1000,
            replica_timeout_secs: 30,
            batch_size: 1000,
            max_frame_bytes: 4 << 20,
        }
    }
}

impl ReplicationConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(master) = &self.master {
            parse_master_addr(master)?;
        }
        if self.batch_size == 0 {
            return Err("replication.batch_size must be greater than 0".to_string());
        }
        if self.max_frame_bytes == 0 || self.max_frame_bytes > MAX_WS_FRAME_BYTES {
            return Err(format!(
                "replication.max_frame_bytes must be between 1 and {}",
                MAX_WS_FRAME_BYTES
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.reconnect_delay_ms == 0 {
            return Err("replication intervals must be greater than 0".to_string());
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(
                "replication.max_reconnect_delay_ms is below reconnect_delay_ms".to_string(),
            );
        }
        if self.replica_timeout_secs * 1000 <= self.heartbeat_interval_ms {
            return Err(
                "replication.replica_timeout_secs must exceed the heartbeat interval".to_string(),
            );
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn replica_timeout(&self) -> Duration {
        Duration::from_secs(self.replica_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .reconnect_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_reconnect_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Normalize a `host:port` master address
pub fn parse_master_addr(addr: &str) -> Result<String, String> {
    let addr = addr.trim();
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("master address '{}' is not host:port", addr))?;

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(format!("master address '{}' has no valid host", addr));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("master address '{}' has no valid port", addr)),
        Ok(_) => Ok(addr.to_string()),
    }
}
