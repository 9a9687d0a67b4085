//! Domain Ports (Port/Adapter Pattern)
//!
//! Contracts for the collaborators the cache engine consumes but does not
//! own. Infrastructure adapters in [`crate::adapters`] implement them.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        Cache Engine           │
//! │  OriginStore │ RemoteStore    │
//! └──────────────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────────────┐
//! │   HttpOrigin │ RedisRemote    │
//! │   InMemory*  (tests, dry run) │
//! └──────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::ByteStream;
use crate::error::Result;

// =============================================================================
// Origin Blob Store
// =============================================================================

/// Authoritative object store behind the cache. Read-only from our side.
#[async_trait]
pub trait OriginStore: Send + Sync {
    /// Size in bytes of the object at `key`
    async fn stat_object(&self, key: &str) -> Result<u64>;

    /// Open a reader over the object at `key`
    async fn get_object(&self, key: &str) -> Result<ByteStream>;
}

// =============================================================================
// Remote Key-Value Store
// =============================================================================

/// Shared network key-value store backing the remote layer.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Set a value with expiry
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Whole value, or None when absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Bytes `start..=end` of a value (empty when absent or out of range)
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Length of a value (0 when absent)
    async fn strlen(&self, key: &str) -> Result<u64>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Keys matching a glob pattern (`*` wildcard)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically write a blob and its metadata fields with one expiry
    async fn set_with_metadata(
        &self,
        data_key: &str,
        value: Bytes,
        metadata: &[(String, String)],
        ttl: Duration,
    ) -> Result<()>;
}
