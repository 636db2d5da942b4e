//! Layered Cache Engine
//!
//! Three tiers probed in latency order, with write-through, promotion on
//! slower-tier hits, adaptive L1 TTL and prioritized warm-up.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          LayeredCache                                     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 (in-process)      │ L2 (remote KV)      │ L3 (persistent)           │
//! │  ┌────────────────┐   │ ┌────────────────┐  │ ┌────────────────────┐    │
//! │  │ Arena LRU      │   │ │ CacheBackend   │  │ │ CacheBackend       │    │
//! │  │ + absolute TTL │   │ │ (e.g. Redis)   │  │ │ (e.g. SQL table)   │    │
//! │  │ native values  │   │ │ JSON bytes     │  │ │ JSON bytes         │    │
//! │  └────────────────┘   │ └────────────────┘  │ └────────────────────┘    │
//! │         ▲             │         ▲           │           │               │
//! │         └─────────────┴─────────┴───────────┴───────────┘               │
//! │                     promotion on slower-tier hit                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  AdaptiveController (L1 TTL)   │   WarmupCoordinator (priority, bounded)  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! Tiers are eventually consistent with each other: a `set` racing a `get`
//! on the same key may leave L1 and L2/L3 briefly disagreeing. There are no
//! cross-tier transactions.

mod adaptive;
mod backend;
mod codec;
mod entry;
mod key;
mod l1;
mod layered;
mod stats;
mod warmup;

pub use adaptive::{AdaptiveController, AdaptiveDecision};
pub use backend::{BackendStats, CacheBackend, InMemoryBackend};
pub use codec::{decode_value, encode_value};
pub use entry::CacheEntry;
pub use key::{encode_key, CacheKey};
pub use l1::L1Cache;
pub use layered::LayeredCache;
pub use stats::{CacheStats, StatsRecorder, TierStats};
pub use warmup::{
    JobOutcome, WarmupCoordinator, WarmupJob, WarmupReport, WarmupTask, MAX_PRIORITY,
    MIN_PRIORITY,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Values the layered cache can hold: cloned out of L1, JSON across L2/L3
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Cache tier enum, in probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// L1 - in-process memory (hot)
    L1,
    /// L2 - remote key/value store (warm)
    L2,
    /// L3 - persistent store (cold)
    L3,
}

impl CacheTier {
    /// Every tier, fastest first
    pub const ALL: [CacheTier; 3] = [CacheTier::L1, CacheTier::L2, CacheTier::L3];

    /// Zero-based position in probe order
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            CacheTier::L1 => 0,
            CacheTier::L2 => 1,
            CacheTier::L3 => 2,
        }
    }

    /// Short label used in logs and metrics
    pub const fn label(self) -> &'static str {
        match self {
            CacheTier::L1 => "l1",
            CacheTier::L2 => "l2",
            CacheTier::L3 => "l3",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (Memory)"),
            CacheTier::L2 => write!(f, "L2 (Remote)"),
            CacheTier::L3 => write!(f, "L3 (Persistent)"),
        }
    }
}

/// Default chunk size for batch deletes
pub const DEFAULT_BATCH_DELETE_CHUNK: usize = 100;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        let indices: Vec<usize> = CacheTier::ALL.iter().map(|t| t.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(format!("{}", CacheTier::L1), "L1 (Memory)");
        assert_eq!(format!("{}", CacheTier::L2), "L2 (Remote)");
        assert_eq!(format!("{}", CacheTier::L3), "L3 (Persistent)");
        assert_eq!(CacheTier::L2.label(), "l2");
    }
}
