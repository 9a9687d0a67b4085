//! Cache Strategy - Size-Based Tier Routing
//!
//! Owns the three layers and the origin, and decides which layer an object
//! belongs in purely from its size:
//!
//! ```text
//!   size <= small   -> MEMORY
//!   size <= medium  -> FILESYSTEM
//!   size <= large   -> REMOTE
//!   otherwise       -> not cached (served from origin)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::background::BackgroundTasks;
use super::filesystem::FileSystemCache;
use super::layer::{CacheLayer, LayerKind, LayerStats};
use super::memory::MemoryCache;
use super::metrics::{AttemptOutcome, LatencyMetrics};
use super::remote::RemoteCache;
use crate::config::{CacheConfig, TierThresholds};
use crate::domain::{OriginStore, RemoteStore};
use crate::error::{with_timeout, Error, LayerFailure, Result};

/// Pure tier selection
pub fn select_layer(thresholds: &TierThresholds, size: u64) -> Option<LayerKind> {
    if size <= thresholds.small {
        Some(LayerKind::Memory)
    } else if size <= thresholds.medium {
        Some(LayerKind::FileSystem)
    } else if size <= thresholds.large {
        Some(LayerKind::Remote)
    } else {
        None
    }
}

/// Result of preloading one object
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadOutcome {
    pub layer: LayerKind,
    pub bytes: u64,
    pub already_cached: bool,
    pub download: Duration,
    pub cache_write: Duration,
}

/// Thresholds as reported in statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    pub small_file_threshold: u64,
    pub medium_file_threshold: u64,
    pub large_file_threshold: u64,
}

impl From<TierThresholds> for StrategyStats {
    fn from(t: TierThresholds) -> Self {
        Self {
            small_file_threshold: t.small,
            medium_file_threshold: t.medium,
            large_file_threshold: t.large,
        }
    }
}

/// Statistics of every layer plus the routing thresholds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub memory: LayerStats,
    pub file_system: LayerStats,
    pub remote: LayerStats,
    pub strategy: StrategyStats,
}

/// Snapshot taken when a background write is scheduled.
///
/// The write is skipped if the object was invalidated or the cache cleared
/// in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket {
    id: Uuid,
    epoch: u64,
    generation: u64,
}

/// Invalidation counters, striped by object id so memory stays fixed.
///
/// Ids sharing a stripe also invalidate each other's pending writes; those
/// writes are skipped, which only costs a later refill.
const GENERATION_STRIPES: usize = 4096;

#[derive(Debug)]
struct Generations {
    epoch: AtomicU64,
    stripes: Box<[AtomicU64]>,
}

impl Default for Generations {
    fn default() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            stripes: (0..GENERATION_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Generations {
    fn stripe(&self, id: &Uuid) -> &AtomicU64 {
        &self.stripes[(id.as_u128() % self.stripes.len() as u128) as usize]
    }

    fn ticket(&self, id: Uuid) -> WriteTicket {
        WriteTicket {
            id,
            epoch: self.epoch.load(Ordering::Acquire),
            generation: self.stripe(&id).load(Ordering::Acquire),
        }
    }

    fn is_current(&self, ticket: &WriteTicket) -> bool {
        ticket.epoch == self.epoch.load(Ordering::Acquire)
            && ticket.generation == self.stripe(&ticket.id).load(Ordering::Acquire)
    }

    fn bump(&self, id: Uuid) {
        self.stripe(&id).fetch_add(1, Ordering::AcqRel);
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Size-based router over the three cache layers
pub struct CacheStrategy {
    memory: Arc<MemoryCache>,
    filesystem: Arc<FileSystemCache>,
    remote: Arc<RemoteCache>,
    origin: Arc<dyn OriginStore>,
    thresholds: TierThresholds,
    origin_timeout: Duration,
    background: Arc<BackgroundTasks>,
    generations: Arc<Generations>,
    shutdown: CancellationToken,
}

impl CacheStrategy {
    /// Build every layer from configuration and start their sweepers
    pub async fn new(
        config: &CacheConfig,
        origin: Arc<dyn OriginStore>,
        remote_store: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        config.validate()?;

        let memory = Arc::new(MemoryCache::with_config(config.memory.clone()));
        let filesystem = Arc::new(FileSystemCache::open(config.filesystem.clone()).await?);
        let remote = Arc::new(RemoteCache::new(
            remote_store,
            config.remote.clone(),
            config.timeouts.remote(),
        ));

        let shutdown = CancellationToken::new();
        memory.spawn_sweeper(shutdown.child_token());
        filesystem.spawn_sweeper(shutdown.child_token());

        Ok(Self {
            memory,
            filesystem,
            remote,
            origin,
            thresholds: config.thresholds,
            origin_timeout: config.timeouts.origin(),
            background: Arc::new(BackgroundTasks::new(config.background.max_pending)),
            generations: Arc::new(Generations::default()),
            shutdown,
        })
    }

    pub fn thresholds(&self) -> TierThresholds {
        self.thresholds
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.background
    }

    /// Which layer an object of `size` bytes belongs in
    pub fn optimal_layer(&self, size: u64) -> Option<LayerKind> {
        let layer = select_layer(&self.thresholds, size);
        match layer {
            Some(kind) => debug!("Cache strategy: {} for size {} bytes", kind, size),
            None => debug!("Cache strategy: DIRECT ORIGIN for size {} bytes (too large)", size),
        }
        layer
    }

    /// The layer instance an object of `size` bytes belongs in
    pub fn optimal_cache(&self, size: u64) -> Option<Arc<dyn CacheLayer>> {
        self.optimal_layer(size).map(|kind| self.layer(kind))
    }

    pub fn layer(&self, kind: LayerKind) -> Arc<dyn CacheLayer> {
        match kind {
            LayerKind::Memory => self.memory.clone() as Arc<dyn CacheLayer>,
            LayerKind::FileSystem => self.filesystem.clone() as Arc<dyn CacheLayer>,
            LayerKind::Remote => self.remote.clone() as Arc<dyn CacheLayer>,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    pub fn filesystem(&self) -> &Arc<FileSystemCache> {
        &self.filesystem
    }

    pub fn remote(&self) -> &Arc<RemoteCache> {
        &self.remote
    }

    fn too_large(&self, size: u64) -> Error {
        Error::TooLarge {
            size,
            limit: self.thresholds.large,
        }
    }

    /// Size of an origin object
    pub async fn stat_origin(&self, key: &str) -> Result<u64> {
        with_timeout("origin stat", self.origin_timeout, self.origin.stat_object(key)).await
    }

    /// Read a whole object from origin
    pub async fn download(&self, key: &str) -> Result<Bytes> {
        with_timeout("origin download", self.origin_timeout, async {
            let mut reader = self.origin.get_object(key).await?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    /// Cache one object in the layer its size selects
    #[instrument(skip(self), fields(layer = tracing::field::Empty))]
    pub async fn preload_object(&self, id: Uuid, key: &str, size: u64) -> Result<PreloadOutcome> {
        let kind = self.optimal_layer(size).ok_or_else(|| self.too_large(size))?;
        tracing::Span::current().record("layer", kind.as_str());
        let layer = self.layer(kind);

        if layer.exists(id).await.unwrap_or(false) {
            debug!("Object {} already cached in {} layer", id, kind);
            return Ok(PreloadOutcome {
                layer: kind,
                bytes: size,
                already_cached: true,
                download: Duration::ZERO,
                cache_write: Duration::ZERO,
            });
        }

        let started = Instant::now();
        let data = self.download(key).await?;
        let download = started.elapsed();
        let bytes = data.len() as u64;

        let started = Instant::now();
        layer.store(id, data).await?;
        let cache_write = started.elapsed();

        info!(
            "Object {} preloaded to {}: download={:?}, cache={:?}, size={}",
            id, kind, download, cache_write, bytes
        );

        Ok(PreloadOutcome {
            layer: kind,
            bytes,
            already_cached: false,
            download,
            cache_write,
        })
    }

    /// Whole-object read through the optimal layer, filling it from origin on a miss.
    ///
    /// Returns the bytes and whether they came from cache.
    pub async fn get_object(&self, id: Uuid, key: &str, size: u64) -> Result<(Bytes, bool)> {
        self.get_object_observed(id, key, size, None).await
    }

    /// [`get_object`](Self::get_object), recording the optimal-layer attempt
    /// and any origin fetch into `metrics`
    #[instrument(skip(self, metrics))]
    pub(crate) async fn get_object_observed(
        &self,
        id: Uuid,
        key: &str,
        size: u64,
        metrics: Option<&LatencyMetrics>,
    ) -> Result<(Bytes, bool)> {
        let kind = self.optimal_layer(size).ok_or_else(|| self.too_large(size))?;
        let layer = self.layer(kind);

        let timer = metrics.map(|m| m.start_attempt(kind));
        let result = layer.get(id).await;
        if let (Some(m), Some(timer)) = (metrics, timer) {
            let bytes = result.as_ref().map_or(0, |data| data.len() as u64);
            m.end_attempt(timer, AttemptOutcome::of(&result), bytes, result.as_ref().err());
        }

        match result {
            Ok(data) => {
                debug!("Cache HIT for {} in {} layer", id, kind);
                return Ok((data, true));
            }
            Err(e) if e.is_not_found() => debug!("Cache MISS for {} in {} layer", id, kind),
            Err(e) => debug!("Cache MISS for {} in {} layer: {}", id, kind, e),
        }

        let started = Instant::now();
        let data = self.download(key).await?;
        if let Some(m) = metrics {
            m.record_origin(started.elapsed());
            m.set_object_size(data.len() as u64);
        }

        let fill = self.guarded_store(self.write_ticket(id), layer, data.clone());
        self.background.spawn("cache fill", async move { fill.await.map(|_| ()) });

        Ok((data, false))
    }

    pub(crate) fn write_ticket(&self, id: Uuid) -> WriteTicket {
        self.generations.ticket(id)
    }

    /// Store into `layer` unless the object was invalidated or the cache
    /// cleared after `ticket` was taken, or it is already resident there.
    ///
    /// Resolves to whether a write happened.
    pub(crate) fn guarded_store(
        &self,
        ticket: WriteTicket,
        layer: Arc<dyn CacheLayer>,
        data: Bytes,
    ) -> impl Future<Output = Result<bool>> + Send + 'static {
        let generations = Arc::clone(&self.generations);
        async move {
            if !generations.is_current(&ticket) {
                debug!("Skipping write of {} to {}: invalidated", ticket.id, layer.kind());
                return Ok(false);
            }
            if layer.exists(ticket.id).await? {
                return Ok(false);
            }
            layer.store(ticket.id, data).await?;
            Ok(true)
        }
    }

    /// Delete from every layer, attempting all three regardless of failures
    #[instrument(skip(self))]
    pub async fn invalidate_object(&self, id: Uuid) -> Result<()> {
        self.generations.bump(id);

        let mut failures = Vec::new();
        for kind in LayerKind::WATERFALL {
            if let Err(e) = self.layer(kind).delete(id).await {
                warn!("Invalidation of {} failed in {} layer: {}", id, kind, e);
                failures.push(LayerFailure {
                    layer: kind,
                    reason: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            info!("Invalidated object {} in all layers", id);
            Ok(())
        } else {
            Err(Error::InvalidationFailed { failures })
        }
    }

    /// Statistics from every layer
    pub async fn statistics(&self) -> Result<TierStats> {
        Ok(TierStats {
            memory: self.memory.stats().await?,
            file_system: self.filesystem.stats().await?,
            remote: self.remote.stats().await?,
            strategy: self.thresholds.into(),
        })
    }

    /// Clear every layer, attempting all three regardless of failures
    pub async fn clear_all(&self) -> Result<()> {
        self.generations.bump_epoch();

        let mut failures = Vec::new();
        for kind in LayerKind::WATERFALL {
            if let Err(e) = self.layer(kind).clear().await {
                warn!("Clearing {} layer failed: {}", kind, e);
                failures.push(LayerFailure {
                    layer: kind,
                    reason: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ClearFailed { failures })
        }
    }

    /// Stop sweepers and wait for background writes
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.background.drain().await;
    }
}

impl Drop for CacheStrategy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::{InMemoryOrigin, InMemoryRemoteStore};
    use crate::config::{FileSystemConfig, MemoryConfig};
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    /// Small thresholds so tests move bytes, not megabytes
    pub(crate) fn small_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            thresholds: TierThresholds {
                small: 100,
                medium: 1_000,
                large: 5_000,
            },
            memory: MemoryConfig {
                capacity_bytes: 10_000,
                max_object_bytes: 100,
                ..Default::default()
            },
            filesystem: FileSystemConfig {
                base_dir: dir.path().join("fs-cache"),
                max_size_bytes: 100_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) async fn strategy_with(
        dir: &TempDir,
    ) -> (CacheStrategy, Arc<InMemoryOrigin>, Arc<InMemoryRemoteStore>) {
        let origin = Arc::new(InMemoryOrigin::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let strategy = CacheStrategy::new(
            &small_config(dir),
            origin.clone() as Arc<dyn OriginStore>,
            remote.clone() as Arc<dyn RemoteStore>,
        )
        .await
        .unwrap();
        (strategy, origin, remote)
    }

    #[test]
    fn test_default_threshold_boundaries() {
        let t = TierThresholds::default();
        assert_eq!(select_layer(&t, 0), Some(LayerKind::Memory));
        assert_eq!(select_layer(&t, 8 * MIB), Some(LayerKind::Memory));
        assert_eq!(select_layer(&t, 8 * MIB + 1), Some(LayerKind::FileSystem));
        assert_eq!(select_layer(&t, 32 * MIB), Some(LayerKind::FileSystem));
        assert_eq!(select_layer(&t, 32 * MIB + 1), Some(LayerKind::Remote));
        assert_eq!(select_layer(&t, 100 * MIB), Some(LayerKind::Remote));
        assert_eq!(select_layer(&t, 100 * MIB + 1), None);
    }

    fn rank(layer: Option<LayerKind>) -> u8 {
        match layer {
            Some(LayerKind::Memory) => 0,
            Some(LayerKind::FileSystem) => 1,
            Some(LayerKind::Remote) => 2,
            None => 3,
        }
    }

    proptest! {
        #[test]
        fn prop_tier_selection_is_monotonic(a in 0u64..200 * MIB, b in 0u64..200 * MIB) {
            let t = TierThresholds::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(rank(select_layer(&t, lo)) <= rank(select_layer(&t, hi)));
        }

        #[test]
        fn prop_tier_selection_is_pure(size in any::<u64>()) {
            let t = TierThresholds::default();
            prop_assert_eq!(select_layer(&t, size), select_layer(&t, size));
        }
    }

    #[tokio::test]
    async fn test_preload_routes_by_size() {
        let dir = TempDir::new().unwrap();
        let (strategy, origin, _) = strategy_with(&dir).await;
        let small = Uuid::new_v4();
        let medium = Uuid::new_v4();
        let large = Uuid::new_v4();
        origin.insert("small", vec![1u8; 50]);
        origin.insert("medium", vec![2u8; 500]);
        origin.insert("large", vec![3u8; 2_000]);

        let outcome = strategy.preload_object(small, "small", 50).await.unwrap();
        assert_eq!(outcome.layer, LayerKind::Memory);
        assert!(!outcome.already_cached);
        assert_eq!(outcome.bytes, 50);

        let outcome = strategy.preload_object(medium, "medium", 500).await.unwrap();
        assert_eq!(outcome.layer, LayerKind::FileSystem);

        let outcome = strategy.preload_object(large, "large", 2_000).await.unwrap();
        assert_eq!(outcome.layer, LayerKind::Remote);

        assert!(strategy.memory().exists(small).await.unwrap());
        assert!(strategy.filesystem().exists(medium).await.unwrap());
        assert!(strategy.remote().exists(large).await.unwrap());
        assert!(!strategy.memory().exists(medium).await.unwrap());
    }

    #[tokio::test]
    async fn test_preload_already_cached_is_noop() {
        let dir = TempDir::new().unwrap();
        let (strategy, origin, _) = strategy_with(&dir).await;
        let id = Uuid::new_v4();
        origin.insert("k", vec![1u8; 10]);

        strategy.preload_object(id, "k", 10).await.unwrap();
        let again = strategy.preload_object(id, "k", 10).await.unwrap();

        assert!(again.already_cached);
        assert_eq!(origin.download_count(), 1);
    }

    #[tokio::test]
    async fn test_preload_too_large() {
        let dir = TempDir::new().unwrap();
        let (strategy, origin, _) = strategy_with(&dir).await;

        let result = strategy.preload_object(Uuid::new_v4(), "huge", 5_001).await;
        assert_matches!(result, Err(Error::TooLarge { size: 5_001, limit: 5_000 }));
        assert_eq!(origin.download_count(), 0);
        assert!(strategy.optimal_cache(5_001).is_none());
    }

    #[tokio::test]
    async fn test_preload_origin_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let (strategy, origin, _) = strategy_with(&dir).await;
        origin.insert("broken", vec![0u8; 10]);
        origin.fail_key("broken");

        let result = strategy.preload_object(Uuid::new_v4(), "broken", 10).await;
        assert_matches!(result, Err(Error::Origin { .. }));
    }

    #[tokio::test]
    async fn test_get_object_miss_fills_in_background() {
        let dir = TempDir::new().unwrap();
        let (strategy, origin, _) = strategy_with(&dir).await;
        let id = Uuid::new_v4();
        origin.insert("k", vec![9u8; 500]);

        let (data, from_cache) = strategy.get_object(id, "k", 500).await.unwrap();
        assert!(!from_cache);
        assert_eq!(data.len(), 500);

        strategy.background().wait_idle().await;
        assert!(strategy.filesystem().exists(id).await.unwrap());

        let (data, from_cache) = strategy.get_object(id, "k", 500).await.unwrap();
        assert!(from_cache);
        assert_eq!(data.as_ref(), &[9u8; 500][..]);
        assert_eq!(origin.download_count(), 1);
    }

    #[tokio::test]
    async fn test_get_object_too_large() {
        let dir = TempDir::new().unwrap();
        let (strategy, _, _) = strategy_with(&dir).await;
        let result = strategy.get_object(Uuid::new_v4(), "k", 10_000).await;
        assert!(result.unwrap_err().is_too_large());
    }

    #[tokio::test]
    async fn test_fill_skipped_after_invalidation() {
        let dir = TempDir::new().unwrap();
        let (strategy, _, _) = strategy_with(&dir).await;
        let id = Uuid::new_v4();

        let ticket = strategy.write_ticket(id);
        strategy.invalidate_object(id).await.unwrap();

        let wrote = strategy
            .guarded_store(ticket, strategy.layer(LayerKind::Memory), Bytes::from_static(b"stale"))
            .await
            .unwrap();
        assert!(!wrote);
        assert!(!strategy.memory().exists(id).await.unwrap());

        // A fresh ticket writes normally
        let wrote = strategy
            .guarded_store(
                strategy.write_ticket(id),
                strategy.layer(LayerKind::Memory),
                Bytes::from_static(b"fresh"),
            )
            .await
            .unwrap();
        assert!(wrote);
    }

    #[test]
    fn test_generations_stay_bounded() {
        let generations = Generations::default();
        let kept = Uuid::new_v4();

        for _ in 0..20_000 {
            generations.bump(Uuid::new_v4());
        }
        assert_eq!(generations.stripes.len(), GENERATION_STRIPES);

        let ticket = generations.ticket(kept);
        assert!(generations.is_current(&ticket));
        generations.bump(kept);
        assert!(!generations.is_current(&ticket));

        let ticket = generations.ticket(kept);
        generations.bump_epoch();
        assert!(!generations.is_current(&ticket));
        assert!(generations.is_current(&generations.ticket(kept)));
    }

    #[tokio::test]
    async fn test_invalidate_removes_from_every_layer() {
        let dir = TempDir::new().unwrap();
        let (strategy, _, _) = strategy_with(&dir).await;
        let id = Uuid::new_v4();
        let data = Bytes::from_static(b"everywhere");

        for kind in LayerKind::WATERFALL {
            strategy.layer(kind).store(id, data.clone()).await.unwrap();
        }
        strategy.invalidate_object(id).await.unwrap();

        for kind in LayerKind::WATERFALL {
            assert!(!strategy.layer(kind).exists(id).await.unwrap(), "{} still holds {}", kind, id);
        }
    }

    #[tokio::test]
    async fn test_invalidate_attempts_all_layers_on_failure() {
        let dir = TempDir::new().unwrap();
        let (strategy, _, remote) = strategy_with(&dir).await;
        let id = Uuid::new_v4();
        strategy.memory().store(id, Bytes::from_static(b"m")).await.unwrap();
        strategy.filesystem().store(id, Bytes::from_static(b"f")).await.unwrap();

        remote.set_failing(true);
        let err = strategy.invalidate_object(id).await.unwrap_err();

        assert_matches!(&err, Error::InvalidationFailed { failures } if failures.len() == 1
            && failures[0].layer == LayerKind::Remote);
        assert!(!strategy.memory().exists(id).await.unwrap());
        assert!(!strategy.filesystem().exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_statistics_and_clear_all() {
        let dir = TempDir::new().unwrap();
        let (strategy, _, _) = strategy_with(&dir).await;
        strategy.memory().store(Uuid::new_v4(), Bytes::from_static(b"abc")).await.unwrap();
        strategy.remote().store(Uuid::new_v4(), Bytes::from_static(b"defg")).await.unwrap();

        let stats = strategy.statistics().await.unwrap();
        assert_eq!(stats.memory.objects, 1);
        assert_eq!(stats.remote.size_bytes, 4);
        assert_eq!(stats.strategy.small_file_threshold, 100);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["strategy"]["largeFileThreshold"], 5_000);
        assert_eq!(json["fileSystem"]["name"], "FILESYSTEM");

        strategy.clear_all().await.unwrap();
        let stats = strategy.statistics().await.unwrap();
        assert_eq!(stats.memory.objects + stats.file_system.objects + stats.remote.objects, 0);
    }

    #[tokio::test]
    async fn test_clear_reports_failing_layer() {
        let dir = TempDir::new().unwrap();
        let (strategy, _, remote) = strategy_with(&dir).await;
        remote.set_failing(true);

        let err = strategy.clear_all().await.unwrap_err();
        assert_matches!(err, Error::ClearFailed { failures } if failures[0].layer == LayerKind::Remote);
    }
}
