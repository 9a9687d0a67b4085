//! In-Process Adapters
//!
//! `OriginStore` and `RemoteStore` implementations backed by `DashMap`, for
//! tests and dry runs. Both support failure injection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::cache::ByteStream;
use crate::domain::ports::{OriginStore, RemoteStore};
use crate::error::{Error, Result};

// =============================================================================
// Origin
// =============================================================================

/// In-memory origin blob store
#[derive(Debug, Default)]
pub struct InMemoryOrigin {
    objects: DashMap<String, Bytes>,
    /// Sizes reported by `stat_object` instead of the real length
    reported_sizes: DashMap<String, u64>,
    failing: RwLock<HashSet<String>>,
    delay: RwLock<Option<Duration>>,
    stats: AtomicU64,
    downloads: AtomicU64,
}

impl InMemoryOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.insert(key.into(), data.into());
    }

    /// Report `size` from `stat_object` without holding that many bytes
    pub fn insert_sized(&self, key: impl Into<String>, size: u64, data: impl Into<Bytes>) {
        let key = key.into();
        self.reported_sizes.insert(key.clone(), size);
        self.objects.insert(key, data.into());
    }

    /// Make every call for `key` fail
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing.write().insert(key.into());
    }

    /// Delay every call, to exercise timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Number of `stat_object` calls served
    pub fn stat_count(&self) -> u64 {
        self.stats.load(Ordering::Relaxed)
    }

    /// Number of `get_object` calls served
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    async fn check(&self, key: &str) -> Result<()> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.read().contains(key) {
            return Err(Error::Origin {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn missing(key: &str) -> Error {
        Error::Origin {
            key: key.to_string(),
            reason: "no such object".to_string(),
        }
    }
}

#[async_trait]
impl OriginStore for InMemoryOrigin {
    async fn stat_object(&self, key: &str) -> Result<u64> {
        self.stats.fetch_add(1, Ordering::Relaxed);
        self.check(key).await?;

        if let Some(size) = self.reported_sizes.get(key) {
            return Ok(*size);
        }
        self.objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Self::missing(key))
    }

    async fn get_object(&self, key: &str) -> Result<ByteStream> {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.check(key).await?;

        let data = self
            .objects
            .get(key)
            .map(|data| data.clone())
            .ok_or_else(|| Self::missing(key))?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}

// =============================================================================
// Remote Store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-memory key-value store with expiry
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    values: DashMap<String, StoredValue>,
    failing: AtomicBool,
    range_calls: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of `get_range` calls served
    pub fn range_calls(&self) -> u64 {
        self.range_calls.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Remote("injected failure".to_string()));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<Bytes> {
        let value = self.values.get(key)?;
        if value.is_live() {
            return Some(value.data.clone());
        }
        drop(value);
        self.values.remove(key);
        None
    }

    fn put(&self, key: &str, data: Bytes, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.values
            .insert(key.to_string(), StoredValue { data, expires_at });
    }
}

/// Glob match supporting `*` only, which is all the cache issues
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    let (first, tail) = parts.split_at(1);
    let Some(after_prefix) = rest.strip_prefix(first[0]) else {
        return false;
    };
    rest = after_prefix;

    let (middle, last) = tail.split_at(tail.len() - 1);
    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last[0])
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check()?;
        self.put(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check()?;
        Ok(self.live(key))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        self.check()?;
        self.range_calls.fetch_add(1, Ordering::Relaxed);

        let Some(data) = self.live(key) else {
            return Ok(Bytes::new());
        };
        let len = data.len() as u64;
        if start >= len || start > end {
            return Ok(Bytes::new());
        }
        let end = end.min(len - 1);
        Ok(data.slice(start as usize..=end as usize))
    }

    async fn strlen(&self, key: &str) -> Result<u64> {
        self.check()?;
        Ok(self.live(key).map_or(0, |data| data.len() as u64))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check()?;
        Ok(keys
            .iter()
            .filter(|key| self.values.remove(key.as_str()).is_some())
            .count() as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .values
            .iter()
            .filter(|entry| entry.value().is_live() && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.live(key).is_some())
    }

    async fn set_with_metadata(
        &self,
        data_key: &str,
        value: Bytes,
        metadata: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        self.check()?;
        self.put(data_key, value, ttl);
        for (key, field) in metadata {
            self.put(key, Bytes::from(field.clone()), ttl);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
