//! Remote Cache - Shared Key-Value Tier
//!
//! Highest-latency tier, shared between service instances through a
//! [`RemoteStore`].
//!
//! # Key Layout
//!
//! ```text
//! <prefix>:<uuid>:data      blob bytes
//! <prefix>:<uuid>:size      decimal length
//! <prefix>:<uuid>:updated   RFC 3339 store time
//! ```
//!
//! All three are written in one atomic pipeline with the same expiry.
//! Streams are served by [`RangeReader`], which pulls one bounded range per
//! consumer demand instead of materialising the blob.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use uuid::Uuid;

use super::layer::{ByteStream, CacheLayer, LayerCounters, LayerKind, LayerStats};
use crate::config::RemoteConfig;
use crate::domain::RemoteStore;
use crate::error::{with_timeout, Error, Result};

/// Remote cache - blobs in a shared key-value store
pub struct RemoteCache {
    store: Arc<dyn RemoteStore>,
    config: RemoteConfig,
    timeout: Duration,
    counters: LayerCounters,
}

impl RemoteCache {
    pub fn new(store: Arc<dyn RemoteStore>, config: RemoteConfig, timeout: Duration) -> Self {
        Self {
            store,
            config,
            timeout,
            counters: LayerCounters::new(),
        }
    }

    fn key(&self, id: Uuid, field: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, id, field)
    }

    /// Key holding the blob bytes for `id`
    pub fn data_key(&self, id: Uuid) -> String {
        self.key(id, "data")
    }

    fn all_keys(&self, id: Uuid) -> Vec<String> {
        vec![self.data_key(id), self.key(id, "size"), self.key(id, "updated")]
    }
}

#[async_trait]
impl CacheLayer for RemoteCache {
    fn kind(&self) -> LayerKind {
        LayerKind::Remote
    }

    async fn store(&self, id: Uuid, data: Bytes) -> Result<()> {
        let size = data.len();
        let metadata = vec![
            (self.key(id, "size"), size.to_string()),
            (self.key(id, "updated"), chrono::Utc::now().to_rfc3339()),
        ];

        with_timeout(
            "remote store",
            self.timeout,
            self.store
                .set_with_metadata(&self.data_key(id), data, &metadata, self.config.ttl()),
        )
        .await?;

        info!("Remote cache: stored object {} ({} bytes)", id, size);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Bytes> {
        let start = Instant::now();
        let key = self.data_key(id);

        match with_timeout("remote get", self.timeout, self.store.get(&key)).await {
            Ok(Some(data)) => {
                self.counters.record_hit(start.elapsed());
                Ok(data)
            }
            Ok(None) => {
                self.counters.record_miss();
                Err(Error::not_found(LayerKind::Remote, id))
            }
            Err(e) => {
                self.counters.record_miss();
                Err(e)
            }
        }
    }

    async fn get_stream(&self, id: Uuid) -> Result<(ByteStream, u64)> {
        let start = Instant::now();
        let key = self.data_key(id);

        let length = match with_timeout("remote strlen", self.timeout, self.store.strlen(&key)).await {
            // STRLEN cannot tell an empty blob from a missing key
            Ok(0) => match with_timeout("remote exists", self.timeout, self.store.exists(&key)).await {
                Ok(true) => 0,
                Ok(false) => {
                    self.counters.record_miss();
                    return Err(Error::not_found(LayerKind::Remote, id));
                }
                Err(e) => {
                    self.counters.record_miss();
                    return Err(e);
                }
            },
            Ok(length) => length,
            Err(e) => {
                self.counters.record_miss();
                return Err(e);
            }
        };

        let reader = RangeReader::new(
            Arc::clone(&self.store),
            key,
            length,
            self.config.chunk_size_bytes,
            self.timeout,
        );
        self.counters.record_hit(start.elapsed());
        Ok((Box::pin(reader), length))
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        with_timeout("remote exists", self.timeout, self.store.exists(&self.data_key(id))).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let removed = with_timeout("remote delete", self.timeout, self.store.delete(&self.all_keys(id))).await?;
        if removed > 0 {
            debug!("Remote cache: deleted object {}", id);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let pattern = format!("{}:*", self.config.key_prefix);
        let keys = with_timeout("remote keys", self.timeout, self.store.keys(&pattern)).await?;

        if !keys.is_empty() {
            with_timeout("remote delete", self.timeout, self.store.delete(&keys)).await?;
        }

        self.counters.reset();
        info!("Remote cache: cleared {} keys", keys.len());
        Ok(())
    }

    async fn stats(&self) -> Result<LayerStats> {
        let pattern = format!("{}:*:data", self.config.key_prefix);
        let keys = with_timeout("remote keys", self.timeout, self.store.keys(&pattern)).await?;

        let mut size_bytes = 0;
        for key in &keys {
            size_bytes += with_timeout("remote strlen", self.timeout, self.store.strlen(key)).await?;
        }

        Ok(self
            .counters
            .snapshot(LayerKind::Remote, keys.len() as u64, size_bytes, 0))
    }
}

// =============================================================================
// Range Reader
// =============================================================================

struct RangeCursor {
    store: Arc<dyn RemoteStore>,
    key: String,
    offset: u64,
    length: u64,
    chunk_size: u64,
    timeout: Duration,
}

impl RangeCursor {
    async fn next_chunk(mut self) -> Option<(io::Result<Bytes>, Self)> {
        if self.offset >= self.length {
            return None;
        }

        let end = (self.offset + self.chunk_size).min(self.length) - 1;
        let fetched = with_timeout(
            "remote get_range",
            self.timeout,
            self.store.get_range(&self.key, self.offset, end),
        )
        .await;

        let chunk = match fetched {
            Ok(chunk) if chunk.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} vanished at offset {} of {}", self.key, self.offset, self.length),
            )),
            Ok(chunk) => Ok(chunk),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        };

        match chunk {
            Ok(chunk) => {
                self.offset += chunk.len() as u64;
                Some((Ok(chunk), self))
            }
            Err(e) => {
                // Terminate after reporting the failure
                self.offset = self.length;
                Some((Err(e), self))
            }
        }
    }
}

/// Lazy reader over a remote blob.
///
/// Issues at most one `get_range` at a time, each no larger than
/// `chunk_size`, and only once the previous chunk has been consumed.
pub struct RangeReader {
    inner: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
}

impl RangeReader {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key: String,
        length: u64,
        chunk_size: u64,
        timeout: Duration,
    ) -> Self {
        let cursor = RangeCursor {
            store,
            key,
            offset: 0,
            length,
            chunk_size: chunk_size.max(1),
            timeout,
        };
        let chunks = stream::unfold(cursor, RangeCursor::next_chunk).boxed();

        Self {
            inner: StreamReader::new(chunks),
        }
    }
}

impl AsyncRead for RangeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

// =============================================================================
// Tests
// =============================================================================
