//! Size-Tiered Multi-Layer Cache
//!
//! Blobs are routed to one layer by size and looked up fastest-first.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                   CacheService (+ InstrumentedCacheService)              │
//! │        preload worker pools │ waterfall lookup │ tallies                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                            CacheStrategy                                 │
//! │     size → layer routing │ origin access │ background fills/promotions   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  MEMORY (LRU, RAM)    │ FILESYSTEM (disk mirror) │ REMOTE (key-value)    │
//! │  ≤ small threshold    │ ≤ medium threshold       │ ≤ large threshold     │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                              OriginStore
//! ```
//!
//! Objects above the large threshold are never cached. A hit in a slower
//! layer schedules a copy into a faster one; generation tickets keep those
//! copies from resurrecting invalidated objects.

mod background;
mod filesystem;
mod instrumented;
mod layer;
mod memory;
pub mod metrics;
mod remote;
mod service;
mod strategy;

pub use background::{BackgroundStats, BackgroundTasks};
pub use filesystem::FileSystemCache;
pub use instrumented::{InstrumentedCacheService, InstrumentedPreloadError};
pub use layer::{ByteStream, CacheLayer, LayerCounters, LayerKind, LayerStats};
pub use memory::MemoryCache;
pub use metrics::{
    AttemptOutcome, LatencyMetrics, LatencyReport, LayerAttempt, PreloadLayerMetrics, PreloadMetrics,
};
pub use remote::{RangeReader, RemoteCache};
pub use service::{
    CacheService, CacheStream, MultiLayerCacheStats, PreloadGroup, PreloadObject, TallySnapshot, ALL_LAYERS,
};
pub use strategy::{select_layer, CacheStrategy, PreloadOutcome, StrategyStats, TierStats, WriteTicket};
