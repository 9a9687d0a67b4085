//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │            OriginStore        │        RemoteStore          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ HttpOrigin        │ RedisRemoteStore                        │ │
//! │  │ InMemoryOrigin    │ InMemoryRemoteStore                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stratacache::adapters::{HttpOrigin, RedisRemoteStore};
//! use stratacache::cache::CacheService;
//!
//! let origin = Arc::new(HttpOrigin::new("https://blobs.internal/models")?);
//! let remote = Arc::new(RedisRemoteStore::connect("redis://127.0.0.1:6379").await?);
//! let service = CacheService::from_config(&config, origin, remote).await?;
//! ```

mod http_origin;
mod memory;
mod redis;

pub use self::http_origin::HttpOrigin;
pub use self::memory::{InMemoryOrigin, InMemoryRemoteStore};
pub use self::redis::RedisRemoteStore;
