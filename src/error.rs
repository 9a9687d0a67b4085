//! Error types for the tiered blob cache

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::cache::LayerKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// A single layer that failed during a fan-out operation (invalidate, clear).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFailure {
    /// Layer that failed
    pub layer: LayerKind,
    /// Rendered error from that layer
    pub reason: String,
}

impl fmt::Display for LayerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.layer, self.reason)
    }
}

fn join_failures(failures: &[LayerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_layer(layer: &Option<LayerKind>) -> String {
    match layer {
        Some(kind) => format!("{} cache", kind),
        None => "any cache layer".to_string(),
    }
}

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Expected control flow
    // =========================================================================
    /// Object absent from a layer (or from every layer when `layer` is None)
    #[error("object {id} not found in {}", describe_layer(.layer))]
    NotFound { layer: Option<LayerKind>, id: Uuid },

    /// Object exceeds the passthrough threshold or a layer's object limit
    #[error("object too large to cache: {size} bytes (limit {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Capacity
    // =========================================================================
    /// A store could not evict enough space
    #[error("{layer} cache cannot free space for {needed} bytes (capacity {capacity} bytes)")]
    CapacityExhausted {
        layer: LayerKind,
        needed: u64,
        capacity: u64,
    },

    // =========================================================================
    // Backing medium failures
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis protocol or connection error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Remote store error not originating from the redis client
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Origin blob store failure
    #[error("Origin store error for {key}: {reason}")]
    Origin { key: String, reason: String },

    /// HTTP transport error talking to the origin
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A backing call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    // =========================================================================
    // Aggregates
    // =========================================================================
    /// One or more layers failed to delete an object
    #[error("invalidation failed in {} layer(s): {}", .failures.len(), join_failures(.failures))]
    InvalidationFailed { failures: Vec<LayerFailure> },

    /// One or more layers failed to clear
    #[error("clear failed in {} layer(s): {}", .failures.len(), join_failures(.failures))]
    ClearFailed { failures: Vec<LayerFailure> },

    /// A batch preload had per-object failures
    #[error("preload had {count} errors: {sample}")]
    PreloadFailed { count: usize, sample: String },

    // =========================================================================
    // Misc
    // =========================================================================
    /// Caller supplied malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Work was cancelled before it started
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Not-found errors drive waterfall fallthrough and are never logged as failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Too-large signals tell callers to stream directly from origin.
    pub fn is_too_large(&self) -> bool {
        matches!(self, Error::TooLarge { .. })
    }

    pub(crate) fn not_found(layer: LayerKind, id: Uuid) -> Self {
        Error::NotFound {
            layer: Some(layer),
            id,
        }
    }
}

/// Run `fut` under `after`, mapping expiry to [`Error::Timeout`].
pub(crate) async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { operation, after }),
    }
}
