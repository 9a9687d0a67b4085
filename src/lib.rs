//! StrataCache - Size-Tiered Multi-Layer Blob Cache
//!
//! Caches large binary objects (3D models, textures, scene assets) fetched
//! from a slow origin store. Each object is routed to exactly one layer by
//! size; lookups consult layers fastest-first and promote slower hits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         CacheService                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    MEMORY    │───▶│  FILESYSTEM  │───▶│    REMOTE    │       │
//! │  │   ≤ 8 MiB    │    │   ≤ 32 MiB   │    │   ≤ 100 MiB  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                   promotions           │             │
//! │          └────────────────────────────────────────┘             │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │ miss
//!                               ▼
//!                          OriginStore
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Origin and remote store implementations
//! - [`cache`] - Layers, routing strategy, service and metrics
//! - [`config`] - Configuration loading and validation
//! - [`domain`] - Ports for external collaborators
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus export and health probes

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{
    CacheLayer, CacheService, CacheStream, InstrumentedCacheService, LatencyMetrics, LayerKind, PreloadMetrics,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
