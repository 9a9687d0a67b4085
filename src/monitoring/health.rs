//! Health Checks
//!
//! Liveness plus a per-layer probe: each layer answers an `exists` for the
//! nil id. A failing remote layer degrades the service; the waterfall keeps
//! serving from the other layers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheLayer, CacheService, LayerKind};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Serving, but a layer is unavailable
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    fn new(name: impl Into<String>, status: HealthStatus, message: Option<String>, took: Duration) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            duration_ms: took.as_millis() as u64,
        }
    }
}

/// Aggregate health report; the worst probe decides the status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Health state of a running cache service
#[derive(Debug)]
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Flip to false when shutting down
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Probe every layer of `service`
    pub async fn check(&self, service: &CacheService) -> HealthReport {
        let mut checks = vec![HealthCheckResult::new(
            "liveness",
            if self.is_live() { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
            None,
            Duration::ZERO,
        )];

        for kind in LayerKind::WATERFALL {
            let started = Instant::now();
            let probe = service.strategy().layer(kind).exists(Uuid::nil()).await;
            let (status, message) = match probe {
                Ok(_) => (HealthStatus::Healthy, None),
                Err(e) if kind == LayerKind::Remote => (HealthStatus::Degraded, Some(e.to_string())),
                Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
            };
            checks.push(HealthCheckResult::new(kind.as_str(), status, message, started.elapsed()));
        }

        HealthReport::new(checks, self.uptime())
    }
}

// =============================================================================
// Tests
// =============================================================================
