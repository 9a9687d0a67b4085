//! Domain Layer
//!
//! Ports describing the external collaborators of the cache engine.

pub mod ports;

pub use ports::{OriginStore, RemoteStore};
