//! Lookup and Preload Metrics
//!
//! Structured observability for one waterfall lookup ([`LatencyMetrics`]) and
//! one batch preload ([`PreloadMetrics`]). Consumers render these however
//! they like; nothing here knows about transports.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::layer::LayerKind;
use crate::error::Error;

fn millis(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

// =============================================================================
// Lookup Latency
// =============================================================================

/// Result of asking one layer for an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Hit,
    Miss,
    Error,
}

impl AttemptOutcome {
    /// Classify a layer result; not-found is a miss, anything else an error
    pub fn of<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => AttemptOutcome::Hit,
            Err(e) if e.is_not_found() => AttemptOutcome::Miss,
            Err(_) => AttemptOutcome::Error,
        }
    }
}

/// One layer attempt during a lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerAttempt {
    pub layer: LayerKind,
    pub outcome: AttemptOutcome,
    pub latency_ms: f64,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Started attempt; hand back to [`LatencyMetrics::end_attempt`]
#[derive(Debug)]
#[must_use]
pub struct AttemptTimer {
    layer: LayerKind,
    started: Instant,
}

/// Serializable view of a lookup's timings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyReport {
    pub object_id: Uuid,
    pub object_size: u64,
    pub total_latency_ms: f64,
    pub cache_layers: Vec<LayerAttempt>,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_layer_used: Option<LayerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_latency_ms: Option<f64>,
    /// Named timings: `cache_<LAYER>`, `cache_waterfall`, `origin`, `promotion`, `total`
    pub timings: BTreeMap<String, f64>,
}

/// Per-request latency recorder.
///
/// Shared behind an `Arc` because promotion latency lands after the lookup
/// has returned.
#[derive(Debug)]
pub struct LatencyMetrics {
    started: Instant,
    report: Mutex<LatencyReport>,
}

impl LatencyMetrics {
    pub fn new(object_id: Uuid) -> Self {
        Self {
            started: Instant::now(),
            report: Mutex::new(LatencyReport {
                object_id,
                ..Default::default()
            }),
        }
    }

    pub fn start_attempt(&self, layer: LayerKind) -> AttemptTimer {
        AttemptTimer {
            layer,
            started: Instant::now(),
        }
    }

    pub fn end_attempt(&self, timer: AttemptTimer, outcome: AttemptOutcome, bytes: u64, error: Option<&Error>) {
        let latency_ms = millis(timer.started.elapsed());
        let mut report = self.report.lock();

        report
            .timings
            .insert(format!("cache_{}", timer.layer), latency_ms);
        if outcome == AttemptOutcome::Hit {
            report.cache_hit = true;
            report.cache_layer_used = Some(timer.layer);
            report.object_size = bytes;
        }
        report.cache_layers.push(LayerAttempt {
            layer: timer.layer,
            outcome,
            latency_ms,
            bytes,
            error: error.map(ToString::to_string),
        });
    }

    /// Time spent serving from origin after a complete miss
    pub fn record_origin(&self, duration: Duration) {
        let ms = millis(duration);
        let mut report = self.report.lock();
        report.origin_latency_ms = Some(ms);
        report.timings.insert("origin".to_string(), ms);
    }

    /// Mark the first byte handed to the consumer
    pub fn record_first_byte(&self) {
        let ms = millis(self.started.elapsed());
        let mut report = self.report.lock();
        report.first_byte_latency_ms = Some(ms);
        report.timings.insert("first_byte".to_string(), ms);
    }

    pub fn record_promotion(&self, duration: Duration) {
        let ms = millis(duration);
        let mut report = self.report.lock();
        report.promotion_latency_ms = Some(ms);
        report.timings.insert("promotion".to_string(), ms);
    }

    pub fn set_object_size(&self, size: u64) {
        self.report.lock().object_size = size;
    }

    /// Stamp total latency and the summed waterfall time
    pub fn finalize(&self) {
        let total = millis(self.started.elapsed());
        let mut report = self.report.lock();

        report.total_latency_ms = total;
        report.timings.insert("total".to_string(), total);

        let waterfall: f64 = report.cache_layers.iter().map(|a| a.latency_ms).sum();
        if waterfall > 0.0 {
            report.timings.insert("cache_waterfall".to_string(), waterfall);
        }
    }

    pub fn attempts(&self) -> Vec<LayerAttempt> {
        self.report.lock().cache_layers.clone()
    }

    pub fn layer_used(&self) -> Option<LayerKind> {
        self.report.lock().cache_layer_used
    }

    pub fn promotion_latency_ms(&self) -> Option<f64> {
        self.report.lock().promotion_latency_ms
    }

    pub fn report(&self) -> LatencyReport {
        self.report.lock().clone()
    }
}

// =============================================================================
// Preload
// =============================================================================

/// Outcome of one preload group (a layer, or the oversized skip bucket)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadLayerMetrics {
    pub layer_name: String,
    pub success_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub total_size: u64,
    pub latency_ms: f64,
    pub max_object_latency_ms: f64,
}

/// Outcome of a batch preload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadMetrics {
    pub started_at: DateTime<Utc>,
    pub total_latency_ms: f64,
    pub object_count: u64,
    /// Sum of resolved origin sizes
    pub total_size: u64,
    pub success: bool,
    pub error_count: u64,
    pub layer_metrics: BTreeMap<String, PreloadLayerMetrics>,
}

impl PreloadMetrics {
    /// Percentage of objects that did not fail
    pub fn success_rate(&self) -> f64 {
        if self.object_count == 0 {
            return 100.0;
        }
        self.object_count.saturating_sub(self.error_count) as f64 / self.object_count as f64 * 100.0
    }

    /// Human-readable multi-line summary
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Preload Summary: {} objects ({:.2}% success), Total Size: {:.2} MB, Duration: {:.2} ms",
            self.object_count,
            self.success_rate(),
            self.total_size as f64 / (1024.0 * 1024.0),
            self.total_latency_ms
        );

        for (name, layer) in &self.layer_metrics {
            summary.push_str(&format!(
                "\n  {} Layer: {} success, {} failed, {} skipped ({:.2} ms)",
                name, layer.success_count, layer.failed_count, layer.skipped_count, layer.latency_ms
            ));
        }
        summary
    }
}

/// Lock-free accumulator for one preload group, shared by its workers
#[derive(Debug, Default)]
pub struct PreloadGroupRecorder {
    success: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    total_size: AtomicU64,
    latency_us: AtomicU64,
    max_object_latency_us: AtomicU64,
}

impl PreloadGroupRecorder {
    pub fn record_success(&self, size: u64, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(size, Ordering::Relaxed);
        self.observe(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.observe(latency);
    }

    pub fn record_skipped(&self, count: u64) {
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Wall time of the whole group
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn observe(&self, latency: Duration) {
        self.max_object_latency_us
            .fetch_max(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, name: &str) -> PreloadLayerMetrics {
        PreloadLayerMetrics {
            layer_name: name.to_string(),
            success_count: self.success.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            skipped_count: self.skipped.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
            latency_ms: self.latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            max_object_latency_ms: self.max_object_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Collects [`PreloadMetrics`] while a batch runs
#[derive(Debug)]
pub struct PreloadRecorder {
    started: Instant,
    started_at: DateTime<Utc>,
    total_size: AtomicU64,
    groups: Mutex<BTreeMap<String, Arc<PreloadGroupRecorder>>>,
}

impl Default for PreloadRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl PreloadRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            total_size: AtomicU64::new(0),
            groups: Mutex::new(BTreeMap::new()),
        }
    }

    /// Count a resolved origin size toward the batch total
    pub fn add_size(&self, size: u64) {
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Recorder for group `name`, created on first use
    pub fn group(&self, name: &str) -> Arc<PreloadGroupRecorder> {
        Arc::clone(self.groups.lock().entry(name.to_string()).or_default())
    }

    pub fn finish(&self, object_count: u64, error_count: u64) -> PreloadMetrics {
        let layer_metrics = self
            .groups
            .lock()
            .iter()
            .map(|(name, group)| (name.clone(), group.snapshot(name)))
            .collect();

        PreloadMetrics {
            started_at: self.started_at,
            total_latency_ms: millis(self.started.elapsed()),
            object_count,
            total_size: self.total_size.load(Ordering::Relaxed),
            success: error_count == 0,
            error_count,
            layer_metrics,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_record_layer_used() {
        let metrics = LatencyMetrics::new(Uuid::new_v4());

        let timer = metrics.start_attempt(LayerKind::Memory);
        metrics.end_attempt(
            timer,
            AttemptOutcome::Miss,
            0,
            Some(&Error::not_found(LayerKind::Memory, Uuid::nil())),
        );
        let timer = metrics.start_attempt(LayerKind::FileSystem);
        metrics.end_attempt(timer, AttemptOutcome::Hit, 2048, None);
        metrics.finalize();

        let report = metrics.report();
        assert!(report.cache_hit);
        assert_eq!(report.cache_layer_used, Some(LayerKind::FileSystem));
        assert_eq!(report.object_size, 2048);
        assert_eq!(report.cache_layers.len(), 2);
        assert!(report.cache_layers[0].error.as_deref().unwrap().contains("not found"));
        assert!(report.timings.contains_key("cache_MEMORY"));
        assert!(report.timings.contains_key("cache_FILESYSTEM"));
        assert!(report.timings.contains_key("total"));
    }

    #[test]
    fn test_attempt_outcome_classification() {
        let hit: Result<(), Error> = Ok(());
        let miss: Result<(), Error> = Err(Error::not_found(LayerKind::Remote, Uuid::nil()));
        let failed: Result<(), Error> = Err(Error::Remote("down".into()));

        assert_eq!(AttemptOutcome::of(&hit), AttemptOutcome::Hit);
        assert_eq!(AttemptOutcome::of(&miss), AttemptOutcome::Miss);
        assert_eq!(AttemptOutcome::of(&failed), AttemptOutcome::Error);
    }

    #[test]
    fn test_promotion_and_serialization() {
        let metrics = LatencyMetrics::new(Uuid::nil());
        assert_eq!(metrics.promotion_latency_ms(), None);

        metrics.record_promotion(Duration::from_micros(1500));
        assert_eq!(metrics.promotion_latency_ms(), Some(1.5));

        let json = serde_json::to_value(metrics.report()).unwrap();
        assert_eq!(json["promotionLatencyMs"], 1.5);
        assert!(json.get("originLatencyMs").is_none());
    }

    #[test]
    fn test_preload_recorder_aggregates_groups() {
        let recorder = PreloadRecorder::new();
        recorder.add_size(300);

        let memory = recorder.group("MEMORY");
        memory.record_success(100, Duration::from_millis(2));
        memory.record_success(200, Duration::from_millis(9));
        memory.record_failure(Duration::from_millis(4));
        memory.set_latency(Duration::from_millis(12));
        recorder.group("SKIP").record_skipped(2);

        let metrics = recorder.finish(5, 1);
        let layer = &metrics.layer_metrics["MEMORY"];
        assert_eq!(layer.success_count, 2);
        assert_eq!(layer.failed_count, 1);
        assert_eq!(layer.total_size, 300);
        assert_eq!(layer.max_object_latency_ms, 9.0);
        assert_eq!(layer.latency_ms, 12.0);
        assert_eq!(metrics.layer_metrics["SKIP"].skipped_count, 2);
        assert!(!metrics.success);
        assert_eq!(metrics.success_rate(), 80.0);

        let summary = metrics.summary();
        assert!(summary.starts_with("Preload Summary: 5 objects (80.00% success)"));
        assert!(summary.contains("MEMORY Layer: 2 success, 1 failed, 0 skipped"));
    }
}
