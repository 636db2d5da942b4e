//! Tiered Cache - Layered L1/L2/L3 Cache Engine
//!
//! A read-through/write-through cache that puts an in-process LRU in front
//! of a remote key/value store and a persistent store, for backends that
//! serve hot market data, recommendations and configuration.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ LayeredCache ──▶ L1 (LRU + TTL) ──▶ L2 backend ──▶ L3 backend
//!                 ▲   ▲
//!                 │   └── AdaptiveController (retunes L1 TTL from hit rate)
//!                 └────── WarmupCoordinator (prioritized, bounded pre-loading)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, orchestration, key codec, adaptive tuning, warm-up
//! - [`config`] - YAML configuration and duration parsing
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus export and periodic stats reporting

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cache::{
    encode_key, AdaptiveController, CacheBackend, CacheKey, CacheStats, CacheTier, InMemoryBackend,
    LayeredCache, WarmupCoordinator, WarmupTask,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use metrics::{MetricsExporter, StatsReporter};
