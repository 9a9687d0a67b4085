//! Memory Cache - In-Process Buffer Pool
//!
//! Lowest-latency tier for small objects.
//!
//! # Design
//!
//! - Single `parking_lot::Mutex` over an LRU-ordered map; reads promote
//! - Byte-bounded: a store evicts least-recently-used entries until it fits
//! - Entries expire `ttl` after being stored; expired entries read as absent
//!   and are removed by a periodic sweep

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::layer::{ByteStream, CacheLayer, LayerCounters, LayerKind, LayerStats};
use crate::config::MemoryConfig;
use crate::error::{Error, Result};

struct MemoryEntry {
    data: Bytes,
    stored_at: Instant,
}

/// Memory cache - bounded in-process buffer pool
pub struct MemoryCache {
    entries: Mutex<LruCache<Uuid, MemoryEntry>>,
    config: MemoryConfig,
    current_size: AtomicU64,
    counters: LayerCounters,
}

impl MemoryCache {
    /// Create a memory cache with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a memory cache with custom configuration
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            config,
            current_size: AtomicU64::new(0),
            counters: LayerCounters::new(),
        }
    }

    fn is_expired(&self, entry: &MemoryEntry) -> bool {
        entry.stored_at.elapsed() > self.config.ttl()
    }

    /// Current resident bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Configured capacity
    pub fn capacity(&self) -> u64 {
        self.config.capacity_bytes
    }

    /// Number of resident entries (expired ones included until swept)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = entries.pop(id) {
                self.current_size
                    .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
            }
        }

        if !expired.is_empty() {
            info!("Memory cache: cleaned up {} expired objects", expired.len());
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
            debug!("Memory cache sweeper stopped");
        })
    }

    fn lookup(&self, id: Uuid) -> Option<Bytes> {
        let mut entries = self.entries.lock();

        let expired = match entries.get(&id) {
            Some(entry) if !self.is_expired(entry) => return Some(entry.data.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(entry) = entries.pop(&id) {
                self.current_size
                    .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
            }
        }
        None
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    fn kind(&self) -> LayerKind {
        LayerKind::Memory
    }

    async fn store(&self, id: Uuid, data: Bytes) -> Result<()> {
        let size = data.len() as u64;

        if size > self.config.max_object_bytes {
            return Err(Error::TooLarge {
                size,
                limit: self.config.max_object_bytes,
            });
        }
        if size > self.config.capacity_bytes {
            return Err(Error::CapacityExhausted {
                layer: LayerKind::Memory,
                needed: size,
                capacity: self.config.capacity_bytes,
            });
        }

        let mut entries = self.entries.lock();

        // Replacement: drop the old copy first so accounting stays exact
        if let Some(old) = entries.pop(&id) {
            self.current_size
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }

        let mut evicted = 0;
        while self.current_size.load(Ordering::Relaxed) + size > self.config.capacity_bytes {
            match entries.pop_lru() {
                Some((victim, entry)) => {
                    self.current_size
                        .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
                    evicted += 1;
                    debug!("Memory cache: evicted {} ({} bytes)", victim, entry.data.len());
                }
                None => break,
            }
        }
        self.counters.record_evictions(evicted);

        entries.put(
            id,
            MemoryEntry {
                data,
                stored_at: Instant::now(),
            },
        );
        self.current_size.fetch_add(size, Ordering::Relaxed);
        drop(entries);

        debug!("Memory cache: stored object {} ({} bytes)", id, size);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Bytes> {
        let start = Instant::now();
        match self.lookup(id) {
            Some(data) => {
                self.counters.record_hit(start.elapsed());
                Ok(data)
            }
            None => {
                self.counters.record_miss();
                Err(Error::not_found(LayerKind::Memory, id))
            }
        }
    }

    async fn get_stream(&self, id: Uuid) -> Result<(ByteStream, u64)> {
        let data = self.get(id).await?;
        let len = data.len() as u64;
        Ok((Box::pin(std::io::Cursor::new(data)), len))
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let entries = self.entries.lock();
        Ok(entries
            .peek(&id)
            .map(|entry| !self.is_expired(entry))
            .unwrap_or(false))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if let Some(entry) = self.entries.lock().pop(&id) {
            self.current_size
                .fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
            debug!("Memory cache: deleted object {} ({} bytes)", id, entry.data.len());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.clear();
        self.current_size.store(0, Ordering::Relaxed);
        self.counters.reset();
        info!("Memory cache: cleared all objects");
        Ok(())
    }

    async fn stats(&self) -> Result<LayerStats> {
        // Expired entries are absent to readers, so they are not counted either
        self.sweep_expired();
        Ok(self.counters.snapshot(
            LayerKind::Memory,
            self.len() as u64,
            self.size(),
            self.capacity(),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
