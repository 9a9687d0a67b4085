//! Prometheus Stats Exporter
//!
//! Mirrors `CacheService::statistics()` into gauges on a private registry so
//! several services can coexist in one process (and in tests).

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheService, LayerStats, MultiLayerCacheStats};
use crate::error::Result;

/// Per-layer gauges refreshed from service statistics
#[derive(Clone)]
pub struct StatsExporter {
    registry: Registry,
    objects: IntGaugeVec,
    bytes: IntGaugeVec,
    capacity: IntGaugeVec,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    evictions: IntGaugeVec,
    background: IntGaugeVec,
    complete_misses: IntGauge,
}

fn layer_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &["layer"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl StatsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let objects = layer_gauge(&registry, "stratacache_layer_objects", "Objects resident per cache layer")?;
        let bytes = layer_gauge(&registry, "stratacache_layer_bytes", "Bytes resident per cache layer")?;
        let capacity = layer_gauge(&registry, "stratacache_layer_capacity_bytes", "Configured capacity per cache layer")?;
        let hits = layer_gauge(&registry, "stratacache_layer_hits", "Lookup hits per cache layer")?;
        let misses = layer_gauge(&registry, "stratacache_layer_misses", "Lookup misses per cache layer")?;
        let evictions = layer_gauge(&registry, "stratacache_layer_evictions", "Evictions per cache layer")?;

        let background = IntGaugeVec::new(
            Opts::new("stratacache_background_tasks", "Background promotions and fills by state"),
            &["state"],
        )?;
        registry.register(Box::new(background.clone()))?;

        let complete_misses = IntGauge::new(
            "stratacache_complete_misses",
            "Lookups that missed every layer",
        )?;
        registry.register(Box::new(complete_misses.clone()))?;

        Ok(Self {
            registry,
            objects,
            bytes,
            capacity,
            hits,
            misses,
            evictions,
            background,
            complete_misses,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn set_layer(&self, layer: &LayerStats) {
        let label = [layer.name.as_str()];
        self.objects.with_label_values(&label).set(clamp(layer.objects));
        self.bytes.with_label_values(&label).set(clamp(layer.size_bytes));
        self.capacity.with_label_values(&label).set(clamp(layer.capacity_bytes));
        self.hits.with_label_values(&label).set(clamp(layer.hits));
        self.misses.with_label_values(&label).set(clamp(layer.misses));
        self.evictions.with_label_values(&label).set(clamp(layer.evictions));
    }

    /// Copy a statistics snapshot into the gauges
    pub fn update(&self, stats: &MultiLayerCacheStats) {
        for layer in [&stats.layers.memory, &stats.layers.file_system, &stats.layers.remote] {
            self.set_layer(layer);
        }

        let bg = &stats.background;
        for (state, value) in [
            ("spawned", bg.spawned),
            ("completed", bg.completed),
            ("failed", bg.failed),
            ("dropped", bg.dropped),
            ("in_flight", bg.in_flight),
        ] {
            self.background.with_label_values(&[state]).set(clamp(value));
        }

        let all_layers = stats
            .tallies
            .misses
            .get(crate::cache::ALL_LAYERS)
            .copied()
            .unwrap_or(0);
        self.complete_misses.set(clamp(all_layers));
    }

    /// Pull statistics from `service` and update the gauges
    pub async fn refresh(&self, service: &CacheService) -> Result<()> {
        let stats = service.statistics().await?;
        self.update(&stats);
        Ok(())
    }

    /// Refresh every `interval` until `shutdown` fires
    pub async fn run(&self, service: Arc<CacheService>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Stats exporter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(&service).await {
                        warn!("Failed to refresh cache statistics: {}", e);
                    }
                }
            }
        }
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BackgroundStats, StrategyStats, TallySnapshot, TierStats};
    use crate::cache::LayerKind;
    use chrono::Utc;

    fn layer(kind: LayerKind, objects: u64, size_bytes: u64) -> LayerStats {
        LayerStats {
            name: kind.as_str().to_string(),
            objects,
            size_bytes,
            capacity_bytes: 1_000,
            hits: 3,
            misses: 1,
            ..Default::default()
        }
    }

    fn stats() -> MultiLayerCacheStats {
        let mut tallies = TallySnapshot::default();
        tallies.misses.insert(crate::cache::ALL_LAYERS.to_string(), 7);
        MultiLayerCacheStats {
            layers: TierStats {
                memory: layer(LayerKind::Memory, 2, 200),
                file_system: layer(LayerKind::FileSystem, 1, 500),
                remote: layer(LayerKind::Remote, 4, 9_000),
                strategy: StrategyStats {
                    small_file_threshold: 1,
                    medium_file_threshold: 2,
                    large_file_threshold: 3,
                },
            },
            tallies,
            background: BackgroundStats {
                spawned: 5,
                dropped: 1,
                ..Default::default()
            },
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_update_sets_layer_gauges() {
        let exporter = StatsExporter::new().unwrap();
        exporter.update(&stats());

        assert_eq!(exporter.objects.with_label_values(&["MEMORY"]).get(), 2);
        assert_eq!(exporter.bytes.with_label_values(&["REMOTE"]).get(), 9_000);
        assert_eq!(exporter.hits.with_label_values(&["FILESYSTEM"]).get(), 3);
        assert_eq!(exporter.background.with_label_values(&["dropped"]).get(), 1);
        assert_eq!(exporter.complete_misses.get(), 7);
    }

    #[test]
    fn test_encode_exposes_metric_names() {
        let exporter = StatsExporter::new().unwrap();
        exporter.update(&stats());

        let text = exporter.encode().unwrap();
        assert!(text.contains("stratacache_layer_objects{layer=\"MEMORY\"} 2"));
        assert!(text.contains("stratacache_layer_misses"));
        assert!(text.contains("stratacache_background_tasks{state=\"spawned\"} 5"));
    }

    #[test]
    fn test_exporters_do_not_collide() {
        let a = StatsExporter::new().unwrap();
        let b = StatsExporter::new().unwrap();
        a.update(&stats());
        assert_eq!(b.objects.with_label_values(&["MEMORY"]).get(), 0);
    }
}
