//! Layered Cache - Unified Three-Tier Cache
//!
//! Orchestrates L1 (in-process), L2 (remote KV) and L3 (persistent) tiers:
//! reads probe fastest-first and back-fill faster tiers on a slower hit,
//! writes go through every enabled tier.
//!
//! # Failure policy
//!
//! - `set`: L2/L3 failures are logged and counted, never returned
//! - `delete`: L2/L3 failures are aggregated and returned
//! - `get`: L2/L3 failures read as a miss for that tier (fail open)
//! - Serialization failures always propagate

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::{CacheBackend, InMemoryBackend};
use super::codec::{decode_value, encode_value};
use super::l1::L1Cache;
use super::stats::{CacheStats, StatsRecorder};
use super::{CacheTier, CacheValue};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Per-call view of the tier configuration, copied out under the read lock
#[derive(Debug, Clone, Copy)]
struct TierPlan {
    l1_ttl: Option<Duration>,
    l2_ttl: Option<Duration>,
    l3_ttl: Option<Duration>,
    backend_timeout: Duration,
}

impl TierPlan {
    /// Configured TTL when the tier is enabled
    fn ttl(&self, tier: CacheTier) -> Option<Duration> {
        match tier {
            CacheTier::L1 => self.l1_ttl,
            CacheTier::L2 => self.l2_ttl,
            CacheTier::L3 => self.l3_ttl,
        }
    }
}

/// Run a backend call, bounded by the backend timeout and the caller's token
async fn guarded<T, F>(
    ctx: &CancellationToken,
    tier: CacheTier,
    timeout: Duration,
    op: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, op) => match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout {
                tier: tier.to_string(),
                timeout,
            }),
        },
    }
}

/// Unified layered cache
pub struct LayeredCache<V> {
    /// L1 (in-process) cache
    l1: L1Cache<V>,
    /// L2 (remote KV) backend
    l2: Option<Arc<dyn CacheBackend>>,
    /// L3 (persistent) backend
    l3: Option<Arc<dyn CacheBackend>>,
    /// Live configuration; the adaptive controller writes the L1 TTL here
    config: RwLock<CacheConfig>,
    /// Statistics recorder
    stats: Arc<StatsRecorder>,
}

impl<V: CacheValue> LayeredCache<V> {
    /// Create an L1-only cache
    pub fn new(config: CacheConfig) -> Self {
        Self::with_backends(config, None, None)
    }

    /// Create a cache over the given L2/L3 backends
    pub fn with_backends(
        config: CacheConfig,
        l2: Option<Arc<dyn CacheBackend>>,
        l3: Option<Arc<dyn CacheBackend>>,
    ) -> Self {
        Self {
            l1: L1Cache::new(config.tiers.l1_max_entries),
            l2,
            l3,
            config: RwLock::new(config),
            stats: Arc::new(StatsRecorder::new()),
        }
    }

    /// Create with in-memory L2/L3 backends (for testing and local runs)
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::with_backends(
            config,
            Some(Arc::new(InMemoryBackend::new("l2-memory"))),
            Some(Arc::new(InMemoryBackend::new("l3-memory"))),
        )
    }

    fn plan(&self) -> TierPlan {
        let config = self.config.read();
        let tiers = &config.tiers;
        TierPlan {
            l1_ttl: tiers.l1.enabled.then_some(tiers.l1.ttl),
            l2_ttl: (tiers.l2.enabled && self.l2.is_some()).then_some(tiers.l2.ttl),
            l3_ttl: (tiers.l3.enabled && self.l3.is_some()).then_some(tiers.l3.ttl),
            backend_timeout: tiers.backend_timeout,
        }
    }

    fn backend(&self, tier: CacheTier) -> Option<&Arc<dyn CacheBackend>> {
        match tier {
            CacheTier::L1 => None,
            CacheTier::L2 => self.l2.as_ref(),
            CacheTier::L3 => self.l3.as_ref(),
        }
    }

    /// Enabled remote tiers, fastest first, with their backend and TTL
    fn remote_tiers(&self, plan: &TierPlan) -> Vec<(CacheTier, &Arc<dyn CacheBackend>, Duration)> {
        [CacheTier::L2, CacheTier::L3]
            .into_iter()
            .filter_map(|tier| Some((tier, self.backend(tier)?, plan.ttl(tier)?)))
            .collect()
    }

    /// Look a key up across tiers, fastest first.
    ///
    /// A hit in L2/L3 back-fills every faster enabled tier with that tier's
    /// configured TTL. Returns `Error::CacheMiss` when no tier holds the key.
    #[instrument(skip(self, ctx), level = "debug")]
    pub async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<V> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plan = self.plan();

        if plan.l1_ttl.is_some() {
            let start = Instant::now();
            if let Some(value) = self.l1.get(key) {
                self.stats.record_hit(CacheTier::L1, start.elapsed());
                return Ok(value);
            }
            self.stats.record_miss(CacheTier::L1, start.elapsed());
        }

        for (tier, backend, _) in self.remote_tiers(&plan) {
            let start = Instant::now();
            match guarded(ctx, tier, plan.backend_timeout, backend.get(key)).await {
                Ok(Some(raw)) => {
                    self.stats.record_hit(tier, start.elapsed());
                    let value: V = decode_value(&raw)?;
                    debug!(key, %tier, "hit in slower tier, promoting");
                    self.promote(ctx, &plan, tier, key, &value, raw).await?;
                    return Ok(value);
                }
                Ok(None) => self.stats.record_miss(tier, start.elapsed()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.stats.record_miss(tier, start.elapsed());
                    self.stats.record_error(tier);
                    warn!(key, %tier, error = %e, "tier read failed, treating as miss");
                }
            }
        }

        debug!(key, "miss on every enabled tier");
        Err(Error::CacheMiss {
            key: key.to_string(),
        })
    }

    /// Copy a value found in `hit_tier` into every faster enabled tier
    async fn promote(
        &self,
        ctx: &CancellationToken,
        plan: &TierPlan,
        hit_tier: CacheTier,
        key: &str,
        value: &V,
        raw: bytes::Bytes,
    ) -> Result<()> {
        if let Some(ttl) = plan.l1_ttl {
            self.l1.set(key, value.clone(), ttl);
            self.stats.record_promotion(CacheTier::L1);
        }

        if hit_tier != CacheTier::L3 {
            return Ok(());
        }
        if let (Some(backend), Some(ttl)) = (self.backend(CacheTier::L2), plan.l2_ttl) {
            // Raw bytes are already in the wire encoding
            match guarded(ctx, CacheTier::L2, plan.backend_timeout, backend.set(key, raw, ttl)).await
            {
                Ok(()) => self.stats.record_promotion(CacheTier::L2),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.stats.record_error(CacheTier::L2);
                    warn!(key, tier = %CacheTier::L2, error = %e, "promotion write failed");
                }
            }
        }
        Ok(())
    }

    /// Write a value through every enabled tier.
    ///
    /// `ttl: None` uses each tier's configured TTL as of this call;
    /// `Some(t)` applies `t` to every tier. L2/L3 failures are logged and
    /// counted as tier errors but never returned.
    #[instrument(skip(self, ctx, value), level = "debug")]
    pub async fn set(
        &self,
        ctx: &CancellationToken,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plan = self.plan();
        let remotes = self.remote_tiers(&plan);

        // Encode before touching any tier so a bad value leaves no partial write
        let raw = if remotes.is_empty() {
            None
        } else {
            Some(encode_value(&value)?)
        };

        if let Some(l1_ttl) = plan.l1_ttl {
            if let Some(evicted) = self.l1.set(key, value, ttl.unwrap_or(l1_ttl)) {
                debug!(key, evicted = %evicted, "L1 at capacity, evicted LRU entry");
            }
            self.stats.record_set(CacheTier::L1);
        }

        if let Some(raw) = raw {
            for (tier, backend, tier_ttl) in remotes {
                let ttl = ttl.unwrap_or(tier_ttl);
                match guarded(ctx, tier, plan.backend_timeout, backend.set(key, raw.clone(), ttl))
                    .await
                {
                    Ok(()) => self.stats.record_set(tier),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        self.stats.record_error(tier);
                        warn!(
                            key,
                            %tier,
                            backend = backend.name(),
                            error = %e,
                            "write-through failed, continuing with remaining tiers"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Remove a key from every tier.
    ///
    /// L1 never fails. L2/L3 failures are collected into one
    /// `Error::InvalidationFailed`; the other tiers are still cleared.
    #[instrument(skip(self, ctx), level = "debug")]
    pub async fn delete(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plan = self.plan();

        // Cleared even when disabled, so re-enabling cannot resurrect a stale value
        self.l1.delete(key);
        if plan.l1_ttl.is_some() {
            self.stats.record_delete(CacheTier::L1);
        }

        let mut failures = Vec::new();
        for (tier, backend, _) in self.remote_tiers(&plan) {
            match guarded(ctx, tier, plan.backend_timeout, backend.delete(key)).await {
                Ok(()) => self.stats.record_delete(tier),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.stats.record_error(tier);
                    warn!(key, %tier, error = %e, "tier delete failed");
                    failures.push(format!("{}: {}", tier, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidationFailed {
                key: key.to_string(),
                failures,
            })
        }
    }

    /// Delete many keys, chunk by chunk.
    ///
    /// Keys within a chunk are deleted concurrently; the next chunk starts
    /// once the current one finishes. Per-key failures are logged, not
    /// returned.
    #[instrument(skip(self, ctx, keys), fields(count = keys.len()))]
    pub async fn batch_delete<K>(&self, ctx: &CancellationToken, keys: &[K]) -> Result<()>
    where
        K: AsRef<str>,
    {
        let chunk_size = self.config.read().tiers.batch_delete_chunk.max(1);
        let mut failed = 0usize;

        for chunk in keys.chunks(chunk_size) {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let results = join_all(chunk.iter().map(|key| self.delete(ctx, key.as_ref()))).await;
            for (key, result) in chunk.iter().zip(results) {
                if let Err(e) = result {
                    failed += 1;
                    debug!(key = key.as_ref(), error = %e, "batch delete of key failed");
                }
            }
        }

        if failed > 0 {
            warn!(failed, total = keys.len(), "batch delete finished with failures");
        }
        Ok(())
    }

    /// Remove every key matching a glob pattern (`*`, `?`, `[...]`).
    ///
    /// A no-op returning 0 when pattern invalidation is disabled. Backend
    /// failures are aggregated like `delete`.
    #[instrument(skip(self, ctx))]
    pub async fn invalidate_by_pattern(&self, ctx: &CancellationToken, pattern: &str) -> Result<u64> {
        if !self.config.read().invalidation.pattern_enabled {
            debug!(pattern, "pattern invalidation disabled, skipping");
            return Ok(0);
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let matcher =
            glob::Pattern::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;
        let plan = self.plan();

        let mut removed = self.l1.remove_matching(|key| matcher.matches(key)) as u64;
        let mut failures = Vec::new();

        for (tier, backend, _) in self.remote_tiers(&plan) {
            match guarded(ctx, tier, plan.backend_timeout, backend.delete_pattern(pattern)).await {
                Ok(count) => removed += count,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.stats.record_error(tier);
                    warn!(pattern, %tier, error = %e, "pattern invalidation failed");
                    failures.push(format!("{}: {}", tier, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::InvalidationFailed {
                key: pattern.to_string(),
                failures,
            });
        }

        info!(pattern, removed, "invalidated keys by pattern");
        Ok(removed)
    }

    /// Return the cached value, or compute it with `loader` on a miss and
    /// write it through with the tiers' default TTLs.
    pub async fn get_or_load<F, Fut>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        loader: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.get(ctx, key).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_miss() => {}
            Err(e) => return Err(e),
        }

        let value = loader().await?;
        self.set(ctx, key, value.clone(), None).await?;
        Ok(value)
    }

    /// Snapshot of counters plus live L1 occupancy and TTL
    pub fn get_stats(&self) -> CacheStats {
        let mut stats = self.stats.snapshot();
        stats.l1_entries = self.l1.len();
        stats.l1_capacity = self.l1.capacity();
        stats.l1_evictions = self.l1.evictions();
        stats.l1_expirations = self.l1.expirations();
        stats.l1_ttl_secs = self.config.read().tiers.l1.ttl.as_secs_f64();
        stats
    }

    /// Copy of the live configuration
    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Mutate the live configuration under the write lock
    pub fn update_config<R>(&self, f: impl FnOnce(&mut CacheConfig) -> R) -> R {
        f(&mut self.config.write())
    }

    /// Current L1 TTL
    pub fn l1_ttl(&self) -> Duration {
        self.config.read().tiers.l1.ttl
    }

    /// Shared statistics recorder
    pub fn stats_recorder(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    /// Get reference to the L1 cache
    pub fn l1(&self) -> &L1Cache<V> {
        &self.l1
    }

    /// Get the L2 backend, if configured
    pub fn l2(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.l2.as_ref()
    }

    /// Get the L3 backend, if configured
    pub fn l3(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.l3.as_ref()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
        price: f64,
    }

    fn quote(symbol: &str, price: f64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price,
        }
    }

    /// Backend whose every call fails
    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Err(Error::backend("failing", "connection refused"))
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
            Err(Error::backend("failing", "connection refused"))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::backend("failing", "connection refused"))
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<u64> {
            Err(Error::backend("failing", "connection refused"))
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    /// Backend that never answers within any sane timeout
    struct SlowBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for SlowBackend {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    struct Tiers {
        cache: LayeredCache<Quote>,
        l2: Arc<InMemoryBackend>,
        l3: Arc<InMemoryBackend>,
    }

    fn tiers(config: CacheConfig) -> Tiers {
        let l2 = Arc::new(InMemoryBackend::new("l2"));
        let l3 = Arc::new(InMemoryBackend::new("l3"));
        let cache = LayeredCache::with_backends(
            config,
            Some(l2.clone() as Arc<dyn CacheBackend>),
            Some(l3.clone() as Arc<dyn CacheBackend>),
        );
        Tiers { cache, l2, l3 }
    }

    #[tokio::test]
    async fn test_set_then_get_hits_l1() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();

        assert_ok!(
            t.cache
                .set(&ctx, "market:BTCUSDT", quote("BTC", 50_000.0), Some(Duration::from_secs(60)))
                .await
        );
        let value = t.cache.get(&ctx, "market:BTCUSDT").await.unwrap();
        assert_eq!(value, quote("BTC", 50_000.0));

        let stats = t.cache.get_stats();
        assert_eq!(stats.l1.hits, 1);
        assert_eq!(stats.l1.sets, 1);
        assert_eq!(stats.l2.hits + stats.l2.misses, 0, "L1 hit must short-circuit");
        assert!(t.l2.contains("market:BTCUSDT"));
        assert!(t.l3.contains("market:BTCUSDT"));
    }

    #[tokio::test]
    async fn test_miss_everywhere() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();

        let err = t.cache.get(&ctx, "nope").await.unwrap_err();
        assert!(err.is_miss());

        let stats = t.cache.get_stats();
        assert_eq!(stats.l1.misses, 1);
        assert_eq!(stats.l2.misses, 1);
        assert_eq!(stats.l3.misses, 1);
    }

    #[tokio::test]
    async fn test_l3_hit_promotes_to_l2_and_l1() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        let raw = encode_value(&quote("ETH", 3_000.0)).unwrap();
        t.l3.set("k", raw, Duration::from_secs(60)).await.unwrap();

        let value = t.cache.get(&ctx, "k").await.unwrap();
        assert_eq!(value, quote("ETH", 3_000.0));

        assert_eq!(t.cache.l1().peek("k"), Some(quote("ETH", 3_000.0)));
        assert!(t.l2.contains("k"));
        // L2 back-fill uses L2's configured TTL, not L3's
        let remaining = t.l2.ttl_remaining("k").unwrap();
        assert!(remaining <= CacheConfig::default().tiers.l2.ttl);

        let stats = t.cache.get_stats();
        assert_eq!(stats.l3.hits, 1);
        assert_eq!(stats.l1.promotions, 1);
        assert_eq!(stats.l2.promotions, 1);

        // Second read is served by L1
        t.cache.get(&ctx, "k").await.unwrap();
        assert_eq!(t.cache.get_stats().l1.hits, 1);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_only_l1() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        let raw = encode_value(&quote("SOL", 150.0)).unwrap();
        t.l2.set("k", raw, Duration::from_secs(60)).await.unwrap();

        t.cache.get(&ctx, "k").await.unwrap();

        assert!(t.cache.l1().contains("k"));
        assert!(!t.l3.contains("k"));
        let stats = t.cache.get_stats();
        assert_eq!(stats.l3.hits + stats.l3.misses, 0);
    }

    #[tokio::test]
    async fn test_disabled_l2_is_skipped() {
        let mut config = CacheConfig::default();
        config.tiers.l2.enabled = false;
        let t = tiers(config);
        let ctx = CancellationToken::new();

        t.cache.set(&ctx, "k", quote("BTC", 1.0), None).await.unwrap();
        assert!(!t.l2.contains("k"));
        assert!(t.l3.contains("k"));

        t.cache.l1().delete("k");
        t.cache.get(&ctx, "k").await.unwrap();
        assert!(!t.l2.contains("k"), "disabled tier must not be back-filled");
    }

    #[tokio::test]
    async fn test_write_through_survives_failing_l2() {
        let l3 = Arc::new(InMemoryBackend::new("l3"));
        let cache: LayeredCache<Quote> = LayeredCache::with_backends(
            CacheConfig::default(),
            Some(Arc::new(FailingBackend)),
            Some(l3.clone()),
        );
        let ctx = CancellationToken::new();

        assert_ok!(cache.set(&ctx, "k", quote("BTC", 1.0), None).await);

        assert_eq!(cache.l1().peek("k"), Some(quote("BTC", 1.0)));
        assert!(l3.contains("k"), "L2 failure must not block L3");
        let stats = cache.get_stats();
        assert_eq!(stats.l2.errors, 1);
        assert_eq!(stats.l2.sets, 0);
        assert_eq!(stats.l3.sets, 1);
    }

    #[tokio::test]
    async fn test_failing_l2_read_falls_through_to_l3() {
        let l3 = Arc::new(InMemoryBackend::new("l3"));
        let cache: LayeredCache<Quote> = LayeredCache::with_backends(
            CacheConfig::default(),
            Some(Arc::new(FailingBackend)),
            Some(l3.clone()),
        );
        let ctx = CancellationToken::new();
        l3.set("k", encode_value(&quote("BTC", 2.0)).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get(&ctx, "k").await.unwrap(), quote("BTC", 2.0));
        let stats = cache.get_stats();
        assert_eq!(stats.l2.misses, 1);
        // One failed read, one failed promotion write
        assert_eq!(stats.l2.errors, 2);
        assert_eq!(stats.l3.hits, 1);
    }

    #[tokio::test]
    async fn test_delete_aggregates_backend_failures() {
        let l3 = Arc::new(InMemoryBackend::new("l3"));
        let cache: LayeredCache<Quote> = LayeredCache::with_backends(
            CacheConfig::default(),
            Some(Arc::new(FailingBackend)),
            Some(l3.clone()),
        );
        let ctx = CancellationToken::new();
        cache.set(&ctx, "k", quote("BTC", 1.0), None).await.unwrap();

        let err = assert_err!(cache.delete(&ctx, "k").await);
        assert_matches!(err, Error::InvalidationFailed { ref key, ref failures } if key == "k" && failures.len() == 1);

        assert!(!cache.l1().contains("k"));
        assert!(!l3.contains("k"));
    }

    #[tokio::test]
    async fn test_delete_clears_every_tier() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        t.cache.set(&ctx, "k", quote("BTC", 1.0), None).await.unwrap();

        assert_ok!(t.cache.delete(&ctx, "k").await);
        assert!(!t.cache.l1().contains("k"));
        assert!(!t.l2.contains("k"));
        assert!(!t.l3.contains("k"));
        assert!(t.cache.get(&ctx, "k").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn test_serialization_failure_escalates_before_any_write() {
        use std::collections::HashMap;

        let l2 = Arc::new(InMemoryBackend::new("l2"));
        let cache: LayeredCache<HashMap<(u8, u8), u8>> =
            LayeredCache::with_backends(CacheConfig::default(), Some(l2.clone()), None);
        let ctx = CancellationToken::new();
        let mut bad = HashMap::new();
        bad.insert((1, 2), 3);

        let err = cache.set(&ctx, "bad", bad, None).await.unwrap_err();
        assert_matches!(err, Error::Serialization(_));
        assert!(!cache.l1().contains("bad"));
        assert!(!l2.contains("bad"));
    }

    #[tokio::test]
    async fn test_corrupt_bytes_escalate_on_read() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        t.l2.set("k", Bytes::from_static(b"{broken"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_matches!(t.cache.get(&ctx, "k").await, Err(Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_default_ttl_follows_live_config() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();

        t.cache.update_config(|c| c.tiers.l1.ttl = Duration::from_secs(42));
        t.cache.set(&ctx, "k", quote("BTC", 1.0), None).await.unwrap();

        assert_eq!(t.cache.l1().entry("k").unwrap().ttl, Duration::from_secs(42));
        assert_eq!(t.cache.get_stats().l1_ttl_secs, 42.0);
    }

    #[tokio::test]
    async fn test_explicit_ttl_applies_to_every_tier() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();

        t.cache
            .set(&ctx, "k", quote("BTC", 1.0), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(t.cache.l1().entry("k").unwrap().ttl, Duration::from_secs(5));
        assert!(t.l2.ttl_remaining("k").unwrap() <= Duration::from_secs(5));
        assert!(t.l3.ttl_remaining("k").unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_batch_delete_spans_chunks() {
        let mut config = CacheConfig::default();
        config.tiers.batch_delete_chunk = 7;
        let t = tiers(config);
        let ctx = CancellationToken::new();

        let keys: Vec<String> = (0..30).map(|i| format!("k{}", i)).collect();
        for key in &keys {
            t.cache.set(&ctx, key, quote("X", 1.0), None).await.unwrap();
        }

        assert_ok!(t.cache.batch_delete(&ctx, &keys).await);
        assert!(t.cache.l1().is_empty());
        assert_eq!(t.l2.stats().object_count, 0);
        assert_eq!(t.l3.stats().object_count, 0);
    }

    #[tokio::test]
    async fn test_batch_delete_swallows_per_key_failures() {
        let cache: LayeredCache<Quote> = LayeredCache::with_backends(
            CacheConfig::default(),
            Some(Arc::new(FailingBackend)),
            None,
        );
        let ctx = CancellationToken::new();
        cache.set(&ctx, "a", quote("A", 1.0), None).await.unwrap();

        assert_ok!(cache.batch_delete(&ctx, &["a", "b"]).await);
        assert!(!cache.l1().contains("a"));
    }

    #[tokio::test]
    async fn test_batch_delete_respects_cancellation() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert_matches!(t.cache.batch_delete(&ctx, &["a"]).await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        for key in ["market:BTC", "market:ETH", "rec:1"] {
            t.cache.set(&ctx, key, quote(key, 1.0), None).await.unwrap();
        }

        let removed = t.cache.invalidate_by_pattern(&ctx, "market:*").await.unwrap();
        // Two keys in each of three tiers
        assert_eq!(removed, 6);
        assert!(!t.cache.l1().contains("market:BTC"));
        assert!(!t.l3.contains("market:ETH"));
        assert!(t.l2.contains("rec:1"));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_disabled_is_noop() {
        let mut config = CacheConfig::default();
        config.invalidation.pattern_enabled = false;
        let t = tiers(config);
        let ctx = CancellationToken::new();
        t.cache.set(&ctx, "market:BTC", quote("BTC", 1.0), None).await.unwrap();

        assert_eq!(t.cache.invalidate_by_pattern(&ctx, "market:*").await.unwrap(), 0);
        assert!(t.cache.l1().contains("market:BTC"));
    }

    #[tokio::test]
    async fn test_invalidate_by_bad_pattern() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        assert_matches!(
            t.cache.invalidate_by_pattern(&ctx, "[").await,
            Err(Error::InvalidPattern(_))
        );
    }

    #[tokio::test]
    async fn test_get_or_load_only_loads_once() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = t
                .cache
                .get_or_load(&ctx, "k", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(quote("BTC", 9.0))
                })
                .await
                .unwrap();
            assert_eq!(value, quote("BTC", 9.0));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(t.l3.contains("k"));
    }

    #[tokio::test]
    async fn test_get_or_load_propagates_loader_error() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();

        let result = t
            .cache
            .get_or_load(&ctx, "k", || async { Err(Error::Internal("upstream down".into())) })
            .await;
        assert_matches!(result, Err(Error::Internal(_)));
        assert!(!t.cache.l1().contains("k"));
    }

    #[tokio::test]
    async fn test_l1_only_cache() {
        let cache: LayeredCache<Quote> = LayeredCache::new(CacheConfig::default());
        let ctx = CancellationToken::new();

        cache.set(&ctx, "k", quote("BTC", 1.0), None).await.unwrap();
        assert_eq!(cache.get(&ctx, "k").await.unwrap(), quote("BTC", 1.0));
        assert!(cache.l2().is_none());
        assert!(cache.l3().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_as_miss() {
        let mut config = CacheConfig::default();
        config.tiers.backend_timeout = Duration::from_millis(200);
        let slow = Arc::new(SlowBackend {
            calls: AtomicUsize::new(0),
        });
        let cache: LayeredCache<Quote> =
            LayeredCache::with_backends(config, Some(slow.clone()), None);
        let ctx = CancellationToken::new();

        assert!(cache.get(&ctx, "k").await.unwrap_err().is_miss());
        assert_ok!(cache.set(&ctx, "k", quote("BTC", 1.0), None).await);

        let stats = cache.get_stats();
        assert_eq!(stats.l2.errors, 2);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_call() {
        let slow = Arc::new(SlowBackend {
            calls: AtomicUsize::new(0),
        });
        let cache: Arc<LayeredCache<Quote>> = Arc::new(LayeredCache::with_backends(
            CacheConfig::default(),
            Some(slow.clone()),
            None,
        ));
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = cache.get(&ctx, "k").await;
        assert_matches!(result, Err(Error::Cancelled));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let t = tiers(CacheConfig::default());
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert_matches!(t.cache.get(&ctx, "k").await, Err(Error::Cancelled));
        assert_matches!(
            t.cache.set(&ctx, "k", quote("BTC", 1.0), None).await,
            Err(Error::Cancelled)
        );
        assert!(!t.cache.l1().contains("k"));
    }
}
