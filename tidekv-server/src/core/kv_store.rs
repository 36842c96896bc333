use super::error::{Result, TideError};
use super::types::{KVConfig, KVStats, KeyRecord, StoredValue, now_ms};
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key-Value store using radix trie for memory-efficient storage
///
/// Mutations are not logged here: writes reach the store only through the
/// `StoreEngine`, which sequences them in the oplog first.
#[derive(Clone)]
pub struct KVStore {
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    stats: Arc<RwLock<KVStats>>,
    config: KVConfig,
}

impl KVStore {
    /// Create a new KV store with the given configuration
    pub fn new(config: KVConfig) -> Self {
        info!(
            "Initializing KV store with max_memory={}MB",
            config.max_memory_mb
        );

        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(KVStats::default())),
            config,
        }
    }

    /// Start background TTL cleanup task
    pub fn start_ttl_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.ttl_cleanup_interval_ms;
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                store.cleanup_expired().await;
            }
        })
    }

    /// Fail if storing `value` under `key` would exceed the memory limit
    pub fn check_capacity(&self, key: &str, value: &str) -> Result<()> {
        let entry_size = key.len() + value.len() + std::mem::size_of::<StoredValue>();
        let max_bytes = self.config.max_memory_mb * 1024 * 1024;
        let stats = self.stats.read();

        if stats.total_memory_bytes + entry_size > max_bytes {
            warn!(
                "Memory limit exceeded: {}/{}",
                stats.total_memory_bytes, max_bytes
            );
            return Err(TideError::MemoryLimitExceeded);
        }
        Ok(())
    }

    /// Insert or replace a key with an absolute expiry (`0` = none)
    pub async fn put(&self, key: &str, value: String, expire_at_ms: u64) {
        debug!(
            "PUT key={}, size={}, expire_at_ms={}",
            key,
            value.len(),
            expire_at_ms
        );

        let stored = StoredValue::new(value, expire_at_ms);
        let new_size = key.len() + stored.size();

        let mut data = self.data.write();
        let previous = data.insert(key.to_string(), stored);

        let mut stats = self.stats.write();
        stats.sets += 1;
        match previous {
            Some(old) => {
                stats.total_memory_bytes =
                    stats.total_memory_bytes.saturating_sub(key.len() + old.size()) + new_size;
            }
            None => {
                stats.total_keys += 1;
                stats.total_memory_bytes += new_size;
            }
        }
    }

    /// Get a value by key
    pub async fn get(&self, key: &str) -> Option<String> {
        debug!("GET key={}", key);

        let now = now_ms();
        let data = self.data.read();
        let mut stats = self.stats.write();
        stats.gets += 1;

        match data.get(key) {
            Some(value) if !value.is_expired(now) => {
                stats.hits += 1;
                Some(value.data.clone())
            }
            _ => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Live value and absolute expiry of a key
    pub async fn entry(&self, key: &str) -> Option<(String, u64)> {
        let now = now_ms();
        let data = self.data.read();
        data.get(key)
            .filter(|value| !value.is_expired(now))
            .map(|value| (value.data.clone(), value.expire_at_ms))
    }

    /// Delete a key
    pub async fn delete(&self, key: &str) -> bool {
        debug!("DELETE key={}", key);

        let mut data = self.data.write();
        match data.remove(key) {
            Some(removed) => {
                let mut stats = self.stats.write();
                stats.dels += 1;
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.total_memory_bytes = stats
                    .total_memory_bytes
                    .saturating_sub(key.len() + removed.size());
                true
            }
            None => false,
        }
    }

    /// Check if a key exists
    pub async fn exists(&self, key: &str) -> bool {
        let now = now_ms();
        let data = self.data.read();
        data.get(key).is_some_and(|value| !value.is_expired(now))
    }

    /// Remaining TTL in seconds: `-2` when the key is missing, `-1` when it never expires
    pub async fn ttl(&self, key: &str) -> i64 {
        let now = now_ms();
        let data = self.data.read();
        match data.get(key) {
            Some(value) if !value.is_expired(now) => match value.remaining_ms(now) {
                Some(ms) => ms.div_ceil(1000) as i64,
                None => -1,
            },
            _ => -2,
        }
    }

    /// Scan live keys in order with a numeric cursor (`0` starts and ends a scan)
    pub async fn scan(
        &self,
        cursor: u64,
        count: usize,
        prefix: Option<&str>,
    ) -> (u64, Vec<String>) {
        debug!("SCAN cursor={}, count={}, prefix={:?}", cursor, count, prefix);

        let now = now_ms();
        let data = self.data.read();
        let live = |(_, value): &(&String, &StoredValue)| !value.is_expired(now);

        let mut keys: Vec<String> = match prefix {
            Some(prefix) => data
                .get_raw_descendant(prefix)
                .map(|subtrie| {
                    subtrie
                        .iter()
                        .filter(|(k, _)| k.starts_with(prefix))
                        .filter(live)
                        .map(|(k, _)| k.clone())
                        .skip(cursor as usize)
                        .take(count + 1)
                        .collect()
                })
                .unwrap_or_default(),
            None => data
                .iter()
                .filter(live)
                .map(|(k, _)| k.clone())
                .skip(cursor as usize)
                .take(count + 1)
                .collect(),
        };

        if keys.len() > count {
            keys.truncate(count);
            (cursor + count as u64, keys)
        } else {
            (0, keys)
        }
    }

    /// All live keys
    pub async fn keys(&self) -> Vec<String> {
        let now = now_ms();
        let data = self.data.read();
        data.iter()
            .filter(|(_, value)| !value.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Every live key with its value and absolute expiry
    pub async fn dump(&self) -> Vec<KeyRecord> {
        let now = now_ms();
        let data = self.data.read();
        data.iter()
            .filter(|(_, value)| !value.is_expired(now))
            .map(|(key, value)| KeyRecord {
                key: key.clone(),
                value: value.data.clone(),
                expire_at_ms: value.expire_at_ms,
            })
            .collect()
    }

    /// Replace the whole content with `records`
    pub async fn replace_all(&self, records: Vec<KeyRecord>) {
        let now = now_ms();
        let mut trie = Trie::new();
        let mut total_memory_bytes = 0;

        for record in records {
            let stored = StoredValue::new(record.value, record.expire_at_ms);
            if stored.is_expired(now) {
                continue;
            }
            total_memory_bytes += record.key.len() + stored.size();
            trie.insert(record.key, stored);
        }

        let total_keys = trie.len();
        *self.data.write() = trie;

        let mut stats = self.stats.write();
        stats.total_keys = total_keys;
        stats.total_memory_bytes = total_memory_bytes;
        info!("KV store replaced with {} keys", total_keys);
    }

    /// Get statistics
    pub async fn stats(&self) -> KVStats {
        self.stats.read().clone()
    }

    /// Clean up expired keys
    async fn cleanup_expired(&self) {
        let now = now_ms();
        let mut data = self.data.write();

        let expired: Vec<(String, usize)> = data
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, v)| (k.clone(), k.len() + v.size()))
            .collect();

        if expired.is_empty() {
            return;
        }

        debug!("Cleaning up {} expired keys", expired.len());
        let mut stats = self.stats.write();
        for (key, size) in &expired {
            data.remove(key);
            stats.total_memory_bytes = stats.total_memory_bytes.saturating_sub(*size);
        }
        stats.total_keys = stats.total_keys.saturating_sub(expired.len());
        stats.expired += expired.len() as u64;
    }
}
