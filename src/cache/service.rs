//! Cache Service - Preload and Waterfall Orchestration
//!
//! Front door of the engine:
//!
//! - **Preload**: resolve sizes at origin, group objects by target layer and
//!   run each group through its own bounded worker pool
//! - **Lookup**: consult MEMORY, then FILESYSTEM, then REMOTE; first hit wins
//!   and slower hits are promoted in the background
//! - **Tallies**: hit/miss counts per layer, for reporting only

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::background::BackgroundStats;
use super::layer::{ByteStream, CacheLayer, LayerKind};
use super::metrics::{AttemptOutcome, LatencyMetrics, PreloadGroupRecorder, PreloadRecorder};
use super::strategy::{CacheStrategy, TierStats};
use crate::config::{CacheConfig, WorkerConfig};
use crate::domain::{OriginStore, RemoteStore};
use crate::error::{Error, Result};

/// Tally key for a lookup that missed every layer
pub const ALL_LAYERS: &str = "ALL_LAYERS";

/// Origin stats issued concurrently while resolving preload sizes
const STAT_CONCURRENCY: usize = 16;

/// One object queued for preload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadObject {
    pub id: Uuid,
    pub storage_key: String,
    pub size: u64,
}

/// Where a preload object is headed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreloadGroup {
    Layer(LayerKind),
    /// Too large for any layer
    Skip,
}

impl PreloadGroup {
    pub fn name(&self) -> &'static str {
        match self {
            PreloadGroup::Layer(kind) => kind.as_str(),
            PreloadGroup::Skip => "SKIP",
        }
    }
}

/// A successful streaming lookup
pub struct CacheStream {
    pub reader: ByteStream,
    pub length: u64,
    pub layer: LayerKind,
}

impl std::fmt::Debug for CacheStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStream")
            .field("length", &self.length)
            .field("layer", &self.layer)
            .finish()
    }
}

/// Hit/miss counts by layer name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    pub hits: BTreeMap<String, u64>,
    pub misses: BTreeMap<String, u64>,
}

/// Everything `statistics()` reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiLayerCacheStats {
    #[serde(flatten)]
    pub layers: TierStats,
    pub tallies: TallySnapshot,
    pub background: BackgroundStats,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tallies {
    hits: RwLock<HashMap<String, u64>>,
    misses: RwLock<HashMap<String, u64>>,
}

impl Tallies {
    fn hit(&self, layer: &str) {
        *self.hits.write().entry(layer.to_string()).or_insert(0) += 1;
    }

    fn miss(&self, layer: &str) {
        *self.misses.write().entry(layer.to_string()).or_insert(0) += 1;
    }

    fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            hits: self.hits.read().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            misses: self.misses.read().iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    fn clear(&self) {
        self.hits.write().clear();
        self.misses.write().clear();
    }
}

/// Multi-layer cache orchestrator
pub struct CacheService {
    strategy: Arc<CacheStrategy>,
    workers: WorkerConfig,
    tallies: Tallies,
}

impl CacheService {
    pub fn new(strategy: CacheStrategy, workers: WorkerConfig) -> Self {
        Self {
            strategy: Arc::new(strategy),
            workers,
            tallies: Tallies::default(),
        }
    }

    /// Build the strategy and every layer from configuration
    pub async fn from_config(
        config: &CacheConfig,
        origin: Arc<dyn OriginStore>,
        remote_store: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let strategy = CacheStrategy::new(config, origin, remote_store).await?;
        Ok(Self::new(strategy, config.workers.clone()))
    }

    pub fn strategy(&self) -> &Arc<CacheStrategy> {
        &self.strategy
    }

    fn worker_count(&self, layer: LayerKind) -> usize {
        let count = match layer {
            LayerKind::Memory => self.workers.memory,
            LayerKind::FileSystem => self.workers.filesystem,
            LayerKind::Remote => self.workers.remote,
        };
        count.max(1)
    }

    // =========================================================================
    // Preload
    // =========================================================================

    /// Preload objects into the layers their sizes select
    pub async fn preload_objects(&self, ids: &[Uuid], keys: &[String]) -> Result<()> {
        self.preload_objects_with_cancel(ids, keys, &CancellationToken::new())
            .await
    }

    /// Like [`preload_objects`](Self::preload_objects); objects not yet
    /// started when `cancel` fires fail with [`Error::Cancelled`]
    #[instrument(skip_all, fields(objects = ids.len()))]
    pub async fn preload_objects_with_cancel(
        &self,
        ids: &[Uuid],
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let failures = self.run_preload(ids, keys, cancel, None).await?;
        aggregate_preload_failures(failures)
    }

    /// Shared preload pipeline. Returns per-object failures; only malformed
    /// input fails the call itself.
    pub(crate) async fn run_preload(
        &self,
        ids: &[Uuid],
        keys: &[String],
        cancel: &CancellationToken,
        recorder: Option<&PreloadRecorder>,
    ) -> Result<Vec<(Uuid, Error)>> {
        if ids.len() != keys.len() {
            return Err(Error::InvalidInput(format!(
                "ids and storage keys must have the same length ({} != {})",
                ids.len(),
                keys.len()
            )));
        }

        info!("Starting preload for {} objects", ids.len());
        let started = Instant::now();
        let mut failures = Vec::new();

        let groups = self
            .group_objects(ids, keys, cancel, recorder, &mut failures)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let group_runs = groups.into_iter().map(|(group, objects)| {
            let group_recorder = recorder.map(|r| r.group(group.name()));
            let tx = tx.clone();
            async move {
                let group_started = Instant::now();
                match group {
                    PreloadGroup::Skip => {
                        info!("Skipping preload for {} oversized objects", objects.len());
                        if let Some(r) = &group_recorder {
                            r.record_skipped(objects.len() as u64);
                        }
                    }
                    PreloadGroup::Layer(kind) => {
                        self.preload_group(kind, objects, cancel, tx, group_recorder.clone())
                            .await;
                    }
                }
                if let Some(r) = &group_recorder {
                    r.set_latency(group_started.elapsed());
                }
            }
        });
        future::join_all(group_runs).await;
        drop(tx);

        while let Some(failure) = rx.recv().await {
            failures.push(failure);
        }

        info!(
            "Preload completed in {:?} with {} errors",
            started.elapsed(),
            failures.len()
        );
        Ok(failures)
    }

    /// Resolve sizes and bucket objects by target layer
    async fn group_objects(
        &self,
        ids: &[Uuid],
        keys: &[String],
        cancel: &CancellationToken,
        recorder: Option<&PreloadRecorder>,
        failures: &mut Vec<(Uuid, Error)>,
    ) -> BTreeMap<PreloadGroup, Vec<PreloadObject>> {
        let strategy = &self.strategy;
        let pending = ids.iter().copied().zip(keys.iter().cloned());
        let resolved: Vec<(Uuid, String, Result<u64>)> = stream::iter(pending)
            .map(|(id, key)| async move {
                if cancel.is_cancelled() {
                    return (id, key, Err(Error::Cancelled));
                }
                let size = strategy.stat_origin(&key).await;
                (id, key, size)
            })
            .buffered(STAT_CONCURRENCY)
            .collect()
            .await;

        let mut groups: BTreeMap<PreloadGroup, Vec<PreloadObject>> = BTreeMap::new();
        for (id, storage_key, size) in resolved {
            let size = match size {
                Ok(size) => size,
                Err(e) => {
                    warn!("Failed to get size for object {}: {}", id, e);
                    failures.push((id, e));
                    continue;
                }
            };
            if let Some(r) = recorder {
                r.add_size(size);
            }

            let group = match self.strategy.optimal_layer(size) {
                Some(kind) => PreloadGroup::Layer(kind),
                None => PreloadGroup::Skip,
            };
            groups.entry(group).or_default().push(PreloadObject {
                id,
                storage_key,
                size,
            });
        }
        groups
    }

    async fn preload_group(
        &self,
        layer: LayerKind,
        objects: Vec<PreloadObject>,
        cancel: &CancellationToken,
        failures: mpsc::UnboundedSender<(Uuid, Error)>,
        recorder: Option<Arc<PreloadGroupRecorder>>,
    ) {
        let workers = self.worker_count(layer);
        info!(
            "Preloading {} objects into {} with {} workers",
            objects.len(),
            layer,
            workers
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for object in objects {
            let semaphore = Arc::clone(&semaphore);
            let strategy = Arc::clone(&self.strategy);
            let cancel = cancel.clone();
            let failures = failures.clone();
            let recorder = recorder.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };

                let started = Instant::now();
                let result = if cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    strategy
                        .preload_object(object.id, &object.storage_key, object.size)
                        .await
                };

                match result {
                    Ok(_) => {
                        if let Some(r) = &recorder {
                            r.record_success(object.size, started.elapsed());
                        }
                    }
                    Err(e) => {
                        if let Some(r) = &recorder {
                            r.record_failure(started.elapsed());
                        }
                        let _ = failures.send((object.id, e));
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Preload worker for {} ended abnormally: {}", layer, e);
                let _ = failures.send((Uuid::nil(), Error::Internal(format!("preload worker: {}", e))));
            }
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Stream an object from the fastest layer holding it
    #[instrument(skip(self))]
    pub async fn get_from_cache_stream(&self, id: Uuid) -> Result<CacheStream> {
        self.stream_lookup(id, None).await
    }

    /// Whole object from the fastest layer holding it
    #[instrument(skip(self))]
    pub async fn get_from_cache(&self, id: Uuid) -> Result<(Bytes, LayerKind)> {
        self.whole_lookup(id, None).await
    }

    /// Whole object through its optimal layer, falling back to origin.
    ///
    /// Returns the bytes and whether they came from cache.
    pub async fn get_object(&self, id: Uuid, key: &str, size: u64) -> Result<(Bytes, bool)> {
        self.strategy.get_object(id, key, size).await
    }

    pub(crate) async fn whole_lookup(
        &self,
        id: Uuid,
        metrics: Option<&Arc<LatencyMetrics>>,
    ) -> Result<(Bytes, LayerKind)> {
        let (data, _, layer) = self
            .waterfall(id, metrics, |layer| {
                async move {
                    let data = layer.get(id).await?;
                    let length = data.len() as u64;
                    Ok::<_, Error>((data, length))
                }
                .boxed()
            })
            .await?;
        Ok((data, layer))
    }

    pub(crate) async fn stream_lookup(
        &self,
        id: Uuid,
        metrics: Option<&Arc<LatencyMetrics>>,
    ) -> Result<CacheStream> {
        let (reader, length, layer) = self
            .waterfall(id, metrics, |layer| {
                async move { layer.get_stream(id).await }.boxed()
            })
            .await?;
        Ok(CacheStream {
            reader,
            length,
            layer,
        })
    }

    async fn waterfall<T, F>(
        &self,
        id: Uuid,
        metrics: Option<&Arc<LatencyMetrics>>,
        mut fetch: F,
    ) -> Result<(T, u64, LayerKind)>
    where
        F: FnMut(Arc<dyn CacheLayer>) -> BoxFuture<'static, Result<(T, u64)>>,
    {
        for kind in LayerKind::WATERFALL {
            let timer = metrics.map(|m| m.start_attempt(kind));
            let result = fetch(self.strategy.layer(kind)).await;

            if let (Some(m), Some(timer)) = (metrics, timer) {
                let bytes = result.as_ref().map_or(0, |(_, length)| *length);
                m.end_attempt(timer, AttemptOutcome::of(&result), bytes, result.as_ref().err());
            }

            match result {
                Ok((value, length)) => {
                    self.tallies.hit(kind.as_str());
                    info!("CACHE HIT: {} layer for object {} (size: {})", kind, id, length);
                    self.schedule_promotion(id, kind, length, metrics.cloned());
                    return Ok((value, length, kind));
                }
                Err(e) => {
                    self.tallies.miss(kind.as_str());
                    if !e.is_not_found() {
                        debug!("{} layer failed for {}, treating as miss: {}", kind, id, e);
                    }
                }
            }
        }

        self.tallies.miss(ALL_LAYERS);
        debug!("CACHE MISS: object {} not found in any cache layer", id);
        Err(Error::NotFound { layer: None, id })
    }

    /// Faster layer an object found in `from` should be copied into
    fn promotion_target(&self, from: LayerKind, length: u64) -> Option<LayerKind> {
        match from {
            LayerKind::Memory => None,
            LayerKind::FileSystem => {
                (length <= self.strategy.thresholds().small).then_some(LayerKind::Memory)
            }
            LayerKind::Remote => match self.strategy.optimal_layer(length) {
                Some(LayerKind::Remote) | None => None,
                target => target,
            },
        }
    }

    fn schedule_promotion(
        &self,
        id: Uuid,
        from: LayerKind,
        length: u64,
        metrics: Option<Arc<LatencyMetrics>>,
    ) {
        let Some(to) = self.promotion_target(from, length) else {
            return;
        };

        let source = self.strategy.layer(from);
        let target = self.strategy.layer(to);
        let ticket = self.strategy.write_ticket(id);
        let strategy = Arc::clone(&self.strategy);

        self.strategy.background().spawn("promotion", async move {
            if target.exists(id).await.unwrap_or(false) {
                return Ok(());
            }

            let started = Instant::now();
            let result = match source.get(id).await {
                Ok(data) => strategy.guarded_store(ticket, target, data).await,
                Err(e) => Err(e),
            };
            let elapsed = started.elapsed();

            if let Some(metrics) = &metrics {
                metrics.record_promotion(elapsed);
            }
            match &result {
                Ok(true) => info!("Promoted object {} from {} to {} (took {:?})", id, from, to, elapsed),
                Ok(false) => debug!("Promotion of {} to {} skipped", id, to),
                Err(e) => warn!("Failed to promote object {} to {}: {}", id, to, e),
            }
            result.map(|_| ())
        });
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove an object from every layer
    pub async fn invalidate_object(&self, id: Uuid) -> Result<()> {
        self.strategy.invalidate_object(id).await
    }

    /// Clear every layer and the tallies
    #[instrument(skip(self))]
    pub async fn clear_cache(&self) -> Result<()> {
        let result = self.strategy.clear_all().await;
        self.tallies.clear();
        info!("Cleared all cache layers");
        result
    }

    pub async fn statistics(&self) -> Result<MultiLayerCacheStats> {
        Ok(MultiLayerCacheStats {
            layers: self.strategy.statistics().await?,
            tallies: self.tallies.snapshot(),
            background: self.strategy.background().stats(),
            generated_at: Utc::now(),
        })
    }

    pub fn tallies(&self) -> TallySnapshot {
        self.tallies.snapshot()
    }

    /// Stop sweepers and wait for in-flight promotions and fills
    pub async fn shutdown(&self) {
        self.strategy.shutdown().await;
        info!("Cache service stopped");
    }
}

pub(crate) fn aggregate_preload_failures(failures: Vec<(Uuid, Error)>) -> Result<()> {
    match failures.first() {
        None => Ok(()),
        Some((id, first)) => Err(Error::PreloadFailed {
            count: failures.len(),
            sample: format!("failed to preload {}: {}", id, first),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
