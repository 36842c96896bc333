use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::KVConfig;
use crate::oplog::OplogConfig;
use crate::persistence::PersistenceConfig;
use crate::replication::ReplicationConfig;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub kv_store: KVConfig,
    pub oplog: OplogConfig,
    pub persistence: PersistenceConfig,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 15500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.oplog.validate().map_err(anyhow::Error::msg)?;
        self.replication.validate().map_err(anyhow::Error::msg)?;
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            );
        }
        Ok(())
    }

    /// Keep every on-disk artifact under `dir` (used by tests and ad-hoc nodes)
    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        let dir = dir.as_ref();
        self.oplog.path = dir.join("oplog");
        self.persistence.checkpoint_path = dir.join("checkpoint.bin");
        self.replication.cursor_path = dir.join("replication_cursor.json");
        self
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
