//! Instrumented Cache Service
//!
//! Decorator over [`CacheService`] that fills [`LatencyMetrics`] and
//! [`PreloadMetrics`] while delegating every decision to the wrapped service.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use super::layer::ByteStream;
use super::metrics::{LatencyMetrics, PreloadMetrics, PreloadRecorder};
use super::service::{aggregate_preload_failures, CacheService, CacheStream, MultiLayerCacheStats};
use crate::error::{Error, Result};

/// Preload failure that still carries the batch metrics
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct InstrumentedPreloadError {
    pub metrics: PreloadMetrics,
    pub source: Error,
}

/// Records first-byte latency on the first non-empty read
struct FirstByteReader {
    inner: ByteStream,
    metrics: Option<Arc<LatencyMetrics>>,
}

impl AsyncRead for FirstByteReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = self.inner.as_mut().poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            if let Some(metrics) = self.metrics.take() {
                metrics.record_first_byte();
            }
        }
        poll
    }
}

/// Cache service that measures what it does
#[derive(Clone)]
pub struct InstrumentedCacheService {
    inner: Arc<CacheService>,
}

impl InstrumentedCacheService {
    pub fn new(inner: Arc<CacheService>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<CacheService> {
        &self.inner
    }

    /// Streaming waterfall lookup with one recorded attempt per layer consulted
    #[instrument(skip(self, metrics))]
    pub async fn get_from_cache_stream_with_metrics(
        &self,
        id: Uuid,
        metrics: &Arc<LatencyMetrics>,
    ) -> Result<CacheStream> {
        let result = self.inner.stream_lookup(id, Some(metrics)).await;
        metrics.finalize();

        let mut stream = result?;
        metrics.set_object_size(stream.length);
        stream.reader = Box::pin(FirstByteReader {
            inner: stream.reader,
            metrics: Some(Arc::clone(metrics)),
        });
        Ok(stream)
    }

    /// Whole-object read through the optimal layer with origin fallback.
    ///
    /// Same result and side effects as [`CacheService::get_object`]; the
    /// optimal-layer attempt and any origin fetch are recorded.
    #[instrument(skip(self, metrics))]
    pub async fn get_object_with_metrics(
        &self,
        id: Uuid,
        key: &str,
        size: u64,
        metrics: &Arc<LatencyMetrics>,
    ) -> Result<(Bytes, bool)> {
        let result = self
            .inner
            .strategy()
            .get_object_observed(id, key, size, Some(metrics.as_ref()))
            .await;
        metrics.finalize();
        result
    }

    /// Preload a batch and report per-group metrics whether or not it failed
    #[instrument(skip_all, fields(objects = ids.len()))]
    pub async fn preload_objects_with_metrics(
        &self,
        ids: &[Uuid],
        keys: &[String],
    ) -> std::result::Result<PreloadMetrics, InstrumentedPreloadError> {
        let recorder = PreloadRecorder::new();
        let object_count = ids.len() as u64;

        let failures = match self
            .inner
            .run_preload(ids, keys, &CancellationToken::new(), Some(&recorder))
            .await
        {
            Ok(failures) => failures,
            Err(source) => {
                return Err(InstrumentedPreloadError {
                    metrics: recorder.finish(object_count, object_count),
                    source,
                });
            }
        };

        let metrics = recorder.finish(object_count, failures.len() as u64);
        info!("{}", metrics.summary());

        match aggregate_preload_failures(failures) {
            Ok(()) => Ok(metrics),
            Err(source) => Err(InstrumentedPreloadError { metrics, source }),
        }
    }

    pub async fn invalidate_object(&self, id: Uuid) -> Result<()> {
        self.inner.invalidate_object(id).await
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.inner.clear_cache().await
    }

    pub async fn statistics(&self) -> Result<MultiLayerCacheStats> {
        self.inner.statistics().await
    }
}

// =============================================================================
// Tests
// =============================================================================
