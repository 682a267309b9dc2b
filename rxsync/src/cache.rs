//! Two-tier read cache
//!
//! Memory tier: bounded map with least-recently-used eviction.
//! Disk tier: `cache_entries` table in the local database, bounded the same way.
//!
//! Entries expire after their TTL and are never returned once expired. Disk
//! hits are promoted to memory. Keys are plain strings; the repositories use
//! `"{collection}:{id}"` and `"{collection}:all"` so a whole collection can be
//! dropped with [`CacheService::invalidate_prefix`].

use crate::clock::{Clock, SystemClock};
use crate::local_db::LocalDatabase;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied by [`CacheService::put`]
    pub default_ttl_secs: u64,
    pub max_memory_entries: usize,
    pub max_disk_entries: u64,
    /// Whether the disk tier is used when a database is attached
    pub disk_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_memory_entries: 512,
            max_disk_entries: 4096,
            disk_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_entries: usize,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: DateTime<Utc>,
    last_access: u64,
}

#[derive(Default)]
struct MemoryTier {
    entries: HashMap<String, MemoryEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl MemoryTier {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, key: String, value: Value, expires_at: DateTime<Utc>, capacity: usize) {
        let last_access = self.next_tick();
        self.entries.insert(
            key,
            MemoryEntry {
                value,
                expires_at,
                last_access,
            },
        );

        while self.entries.len() > capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
        }
    }
}

pub struct CacheService {
    config: CacheConfig,
    memory: Mutex<MemoryTier>,
    disk: Option<LocalDatabase>,
    clock: Arc<dyn Clock>,
}

impl CacheService {
    /// Memory-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            memory: Mutex::new(MemoryTier::default()),
            disk: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Attach the disk tier
    pub fn with_disk(mut self, db: LocalDatabase) -> Self {
        if self.config.disk_enabled {
            self.disk = Some(db);
        }
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.default_ttl_secs)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();

        {
            let mut memory = self.memory.lock();
            let tick = memory.next_tick();
            match memory.entries.get_mut(key) {
                Some(entry) if now < entry.expires_at => {
                    entry.last_access = tick;
                    let value = entry.value.clone();
                    memory.hits += 1;
                    return Some(value);
                }
                Some(_) => {
                    memory.entries.remove(key);
                }
                None => {}
            }
        }

        if let Some(value) = self.disk_get(key, now).await {
            let mut memory = self.memory.lock();
            memory.hits += 1;
            return Some(value);
        }

        self.memory.lock().misses += 1;
        None
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Dropping undecodable cache entry");
                self.invalidate(key).await;
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: Value) {
        self.put_with_ttl(key, value, self.default_ttl()).await;
    }

    pub async fn put_as<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.put(key, value).await,
            Err(e) => tracing::warn!(key = key, error = %e, "Value not cacheable"),
        }
    }

    pub async fn put_with_ttl(&self, key: &str, value: Value, ttl: std::time::Duration) {
        let now = self.clock.now();
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(3650));
        let expires_at = now.checked_add_signed(ttl).unwrap_or(now);

        self.memory
            .lock()
            .insert(key.to_string(), value.clone(), expires_at, self.config.max_memory_entries);

        if let Some(disk) = &self.disk {
            let result = async {
                disk.cache_put(key, &value, expires_at.timestamp_millis(), now.timestamp_millis())
                    .await?;
                disk.cache_evict_to(self.config.max_disk_entries).await
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(key = key, error = %e, "Disk cache write failed");
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.memory.lock().entries.remove(key);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.cache_remove(key).await {
                tracing::warn!(key = key, error = %e, "Disk cache invalidation failed");
            }
        }
    }

    /// Drop every key starting with `prefix` from both tiers
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut memory = self.memory.lock();
            let before = memory.entries.len();
            memory.entries.retain(|key, _| !key.starts_with(prefix));
            before - memory.entries.len()
        };

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.cache_remove_prefix(prefix).await {
                tracing::warn!(
                    prefix = prefix,
                    error = %e,
                    "Disk cache prefix invalidation failed"
                );
            }
        }

        tracing::trace!(prefix = prefix, removed = removed, "Invalidated cache prefix");
        removed
    }

    /// Remove expired entries from both tiers
    pub async fn purge_expired(&self) {
        let now = self.clock.now();
        self.memory.lock().entries.retain(|_, entry| now < entry.expires_at);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.cache_purge_expired(now.timestamp_millis()).await {
                tracing::warn!(error = %e, "Disk cache purge failed");
            }
        }
    }

    pub async fn clear(&self) {
        self.memory.lock().entries.clear();
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.cache_clear().await {
                tracing::warn!(error = %e, "Disk cache clear failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock();
        CacheStats {
            hits: memory.hits,
            misses: memory.misses,
            evictions: memory.evictions,
            memory_entries: memory.entries.len(),
        }
    }

    async fn disk_get(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        let disk = self.disk.as_ref()?;
        let now_ms = now.timestamp_millis();

        match disk.cache_get(key).await {
            Ok(Some((value, expires_at_ms))) if now_ms < expires_at_ms => {
                if let Err(e) = disk.cache_touch(key, now_ms).await {
                    tracing::debug!(key = key, error = %e, "Disk cache touch failed");
                }
                let expires_at =
                    DateTime::<Utc>::from_timestamp_millis(expires_at_ms).unwrap_or(now);
                self.memory.lock().insert(
                    key.to_string(),
                    value.clone(),
                    expires_at,
                    self.config.max_memory_entries,
                );
                Some(value)
            }
            Ok(Some(_)) => {
                if let Err(e) = disk.cache_remove(key).await {
                    tracing::debug!(key = key, error = %e, "Expired disk cache removal failed");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Disk cache read failed");
                None
            }
        }
    }
}
