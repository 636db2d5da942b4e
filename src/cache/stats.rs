//! Cache Statistics
//!
//! Lock-free per-tier counters and rolling read latency, shared by the
//! layered cache (recording), the adaptive controller and the reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::CacheTier;

/// EMA smoothing factor for read latency
const LATENCY_ALPHA: f64 = 0.1;

/// Counters for one tier
#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    promotions: AtomicU64,
    /// Rolling average probe latency in nanoseconds
    latency_ns: AtomicU64,
}

impl TierCounters {
    fn record_latency(&self, duration: Duration) {
        let sample = duration.as_nanos().min(u64::MAX as u128) as u64;

        loop {
            let current = self.latency_ns.load(Ordering::Relaxed);
            let updated = if current == 0 {
                sample.max(1)
            } else {
                ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * sample as f64) as u64
            };

            if self
                .latency_ns
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn snapshot(&self) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        TierStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            avg_latency_us: self.latency_ns.load(Ordering::Relaxed) as f64 / 1_000.0,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Process-lifetime statistics recorder
#[derive(Debug, Default)]
pub struct StatsRecorder {
    tiers: [TierCounters; 3],
}

impl StatsRecorder {
    /// Create a new recorder with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: CacheTier) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    /// Record a successful probe
    pub fn record_hit(&self, tier: CacheTier, latency: Duration) {
        let counters = self.tier(tier);
        counters.hits.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency);
    }

    /// Record a probe that found nothing
    pub fn record_miss(&self, tier: CacheTier, latency: Duration) {
        let counters = self.tier(tier);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency);
    }

    /// Record a write that landed in a tier
    pub fn record_set(&self, tier: CacheTier) {
        self.tier(tier).sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delete issued against a tier
    pub fn record_delete(&self, tier: CacheTier) {
        self.tier(tier).deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a backend failure (transport, timeout)
    pub fn record_error(&self, tier: CacheTier) {
        self.tier(tier).errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a back-fill into a faster tier after a slower-tier hit
    pub fn record_promotion(&self, tier: CacheTier) {
        self.tier(tier).promotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Hits across all tiers
    pub fn total_hits(&self) -> u64 {
        self.tiers
            .iter()
            .map(|t| t.hits.load(Ordering::Relaxed))
            .sum()
    }

    /// Hits plus misses across all tiers
    pub fn total_requests(&self) -> u64 {
        self.tiers
            .iter()
            .map(|t| t.hits.load(Ordering::Relaxed) + t.misses.load(Ordering::Relaxed))
            .sum()
    }

    /// Stats for one tier
    pub fn tier_stats(&self, tier: CacheTier) -> TierStats {
        self.tier(tier).snapshot()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> CacheStats {
        let l1 = self.tiers[0].snapshot();
        let l2 = self.tiers[1].snapshot();
        let l3 = self.tiers[2].snapshot();

        let total_hits = l1.hits + l2.hits + l3.hits;
        let total_requests = total_hits + l1.misses + l2.misses + l3.misses;

        CacheStats {
            l1,
            l2,
            l3,
            total_hits,
            total_requests,
            overall_hit_rate: if total_requests == 0 {
                0.0
            } else {
                total_hits as f64 / total_requests as f64
            },
            l1_entries: 0,
            l1_capacity: 0,
            l1_evictions: 0,
            l1_expirations: 0,
            l1_ttl_secs: 0.0,
        }
    }
}

/// Statistics for one tier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub promotions: u64,
    /// Rolling average probe latency (microseconds)
    pub avg_latency_us: f64,
    /// hits / (hits + misses) for this tier
    pub hit_rate: f64,
}

/// Snapshot exposed through `LayeredCache::get_stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
    pub l3: TierStats,
    /// Sum of hits over all tiers
    pub total_hits: u64,
    /// Sum of hits and misses over all tiers
    pub total_requests: u64,
    /// total_hits / total_requests
    pub overall_hit_rate: f64,
    /// Resident L1 entries
    pub l1_entries: usize,
    /// L1 entry capacity
    pub l1_capacity: usize,
    /// L1 capacity evictions
    pub l1_evictions: u64,
    /// L1 lazy expirations
    pub l1_expirations: u64,
    /// Current L1 TTL (seconds)
    pub l1_ttl_secs: f64,
}

impl CacheStats {
    /// Stats for one tier
    pub fn tier(&self, tier: CacheTier) -> &TierStats {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
            CacheTier::L3 => &self.l3,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
