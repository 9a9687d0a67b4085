//! Cache Layer Contract
//!
//! Uniform capability every storage tier implements, plus the shared
//! bookkeeping (hit/miss counters, read latency) the tiers report through
//! [`LayerStats`].

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::Result;

/// Pull-based reader handed to callers of `get_stream`.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Cache layer identity, in waterfall priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayerKind {
    /// In-process buffer pool
    Memory,
    /// Local disk mirror
    FileSystem,
    /// Shared network key-value store
    Remote,
}

impl LayerKind {
    /// Waterfall order: fastest first.
    pub const WATERFALL: [LayerKind; 3] = [LayerKind::Memory, LayerKind::FileSystem, LayerKind::Remote];

    /// Stable name used in tallies, metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Memory => "MEMORY",
            LayerKind::FileSystem => "FILESYSTEM",
            LayerKind::Remote => "REMOTE",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time statistics for one layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStats {
    /// Layer display name
    pub name: String,
    /// Resident object count
    pub objects: u64,
    /// Resident bytes
    pub size_bytes: u64,
    /// Configured capacity in bytes (0 = unbounded)
    pub capacity_bytes: u64,
    /// Cumulative hits since last clear
    pub hits: u64,
    /// Cumulative misses since last clear
    pub misses: u64,
    /// Hit rate in percent (0 - 100)
    pub hit_rate: f64,
    /// Moving average of successful read latency
    pub avg_latency_ms: f64,
    /// Objects removed to make room
    pub evictions: u64,
}

/// Storage tier contract
///
/// Layers never update in place: a `store` of a resident id replaces it with
/// exact accounting, and reads either return current bytes or `NotFound`.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Which tier this is
    fn kind(&self) -> LayerKind;

    /// Store an object's full bytes
    async fn store(&self, id: Uuid, data: Bytes) -> Result<()>;

    /// Fetch the whole object
    async fn get(&self, id: Uuid) -> Result<Bytes>;

    /// Open a pull-based reader over the object, with its length
    async fn get_stream(&self, id: Uuid) -> Result<(ByteStream, u64)>;

    /// Check residency without counting a hit or miss
    async fn exists(&self, id: Uuid) -> Result<bool>;

    /// Remove an object; absent ids are not an error
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Remove everything and reset counters
    async fn clear(&self) -> Result<()>;

    /// Current statistics
    async fn stats(&self) -> Result<LayerStats>;
}

/// Hit/miss/latency bookkeeping shared by every layer
#[derive(Debug, Default)]
pub struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    // Exponential moving average, microseconds
    read_latency_us: AtomicU64,
}

impl LayerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, latency: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(latency);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total * 100.0
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.read_latency_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.read_latency_us.store(0, Ordering::Relaxed);
    }

    /// Build stats for a layer from its residency figures
    pub fn snapshot(&self, kind: LayerKind, objects: u64, size_bytes: u64, capacity_bytes: u64) -> LayerStats {
        LayerStats {
            name: kind.as_str().to_string(),
            objects,
            size_bytes,
            capacity_bytes,
            hits: self.hits(),
            misses: self.misses(),
            hit_rate: self.hit_rate(),
            avg_latency_ms: self.avg_latency_ms(),
            evictions: self.evictions(),
        }
    }

    fn update_latency_ema(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.read_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us.max(1)
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .read_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}
