//! Monitoring
//!
//! Prometheus export of cache statistics and layer health probes, served by
//! the `serve` subcommand.
//!
//! ```text
//! CacheService::statistics() ──▶ StatsExporter ──▶ /metrics
//! CacheLayer::exists(nil)    ──▶ HealthCheck   ──▶ /healthz
//! ```

mod exporter;
mod health;

pub use exporter::StatsExporter;
pub use health::{HealthCheck, HealthCheckResult, HealthReport, HealthStatus};
