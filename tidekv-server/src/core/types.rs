use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Stored value in the KV store with metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub data: String,
    /// Absolute deadline in epoch milliseconds, `0` = no expiry
    pub expire_at_ms: u64,
}

impl StoredValue {
    pub fn new(data: String, expire_at_ms: u64) -> Self {
        Self { data, expire_at_ms }
    }

    /// Check if the value has expired at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at_ms != 0 && now_ms >= self.expire_at_ms
    }

    /// Remaining lifetime in milliseconds, `None` when the value never expires
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        (self.expire_at_ms != 0).then(|| self.expire_at_ms.saturating_sub(now_ms))
    }

    pub fn size(&self) -> usize {
        self.data.len() + std::mem::size_of::<Self>()
    }
}

/// A live key with its absolute expiry, as carried by snapshots and checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    pub value: String,
    pub expire_at_ms: u64,
}

/// Configuration for KV store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KVConfig {
    /// Maximum memory in MB
    pub max_memory_mb: usize,
    /// TTL cleanup interval in milliseconds
    pub ttl_cleanup_interval_ms: u64,
}

impl Default for KVConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 4096,
            ttl_cleanup_interval_ms: 100,
        }
    }
}

/// Statistics for KV store
#[derive(Debug, Default, Clone, Serialize)]
pub struct KVStats {
    /// Total number of keys
    pub total_keys: usize,
    /// Estimated memory usage in bytes
    pub total_memory_bytes: usize,
    pub gets: u64,
    pub sets: u64,
    pub dels: u64,
    pub hits: u64,
    pub misses: u64,
    /// Keys removed by TTL expiry
    pub expired: u64,
}

impl KVStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
