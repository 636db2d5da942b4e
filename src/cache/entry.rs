//! Cache Entry Types
//!
//! Resident L1 entries. TTL is absolute from the write: reads update the
//! access bookkeeping but never move `created_at`.

use std::time::Duration;

use tokio::time::Instant;

/// One resident L1 value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Key the entry is indexed under
    pub key: String,
    /// Cached value, stored natively (no serialization in L1)
    pub value: V,
    /// Lifetime measured from `created_at`
    pub ttl: Duration,
    /// Insertion time; fixed for the life of the entry
    pub created_at: Instant,
    /// Last successful read
    pub accessed_at: Instant,
    /// Successful reads since insertion
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    /// Create an entry stamped with the current time
    pub fn new(key: String, value: V, ttl: Duration) -> Self {
        Self::created_at(key, value, ttl, Instant::now())
    }

    /// Create an entry stamped with an explicit insertion time
    pub fn created_at(key: String, value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            key,
            value,
            ttl,
            created_at: now,
            accessed_at: now,
            access_count: 0,
        }
    }

    /// Whether the entry is stale at `now`
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    /// Whether the entry is stale right now
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Record a read
    #[inline]
    pub fn record_access(&mut self, now: Instant) {
        self.accessed_at = now;
        self.access_count += 1;
    }

    /// Time since insertion
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Remaining lifetime, zero once expired
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }
}

// =============================================================================
// Tests
// =============================================================================
