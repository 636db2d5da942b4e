//! Prometheus Exporter
//!
//! Mirrors `CacheStats` snapshots into a private Prometheus registry.
//! Cumulative cache counters are exported as Prometheus counters by adding
//! the delta since the previous snapshot.

use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::cache::{CacheStats, CacheTier, TierStats, WarmupReport};
use crate::error::Result;

/// Metric name prefix
const NAMESPACE: &str = "tiered_cache";

/// Number of per-tier counter families
const TIER_COUNTERS: usize = 6;

/// Highest cumulative values already exported. Only ever moves forward.
#[derive(Default)]
struct Baseline {
    tiers: [[u64; TIER_COUNTERS]; 3],
    l1_evictions: u64,
    l1_expirations: u64,
}

impl Baseline {
    /// Advance `seen` to `now`, returning how far it moved
    fn advance(seen: &mut u64, now: u64) -> u64 {
        let delta = now.saturating_sub(*seen);
        *seen = (*seen).max(now);
        delta
    }
}

/// Per-tier counter family
struct TierCounter {
    vec: IntCounterVec,
    read: fn(&TierStats) -> u64,
}

/// Prometheus view of the layered cache
pub struct MetricsExporter {
    registry: Registry,
    tier_counters: Vec<TierCounter>,
    hit_rate: GaugeVec,
    latency_us: GaugeVec,
    overall_hit_rate: Gauge,
    l1_entries: IntGauge,
    l1_capacity: IntGauge,
    l1_ttl_seconds: Gauge,
    l1_evictions: IntCounter,
    l1_expirations: IntCounter,
    warmup_jobs: IntCounterVec,
    warmup_cycles: IntCounter,
    last: Mutex<Baseline>,
}

impl MetricsExporter {
    /// Create an exporter with every metric registered
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let families: [(&str, &str, fn(&TierStats) -> u64); TIER_COUNTERS] = [
            ("hits_total", "Lookups answered by the tier", |t| t.hits),
            ("misses_total", "Lookups the tier could not answer", |t| t.misses),
            ("sets_total", "Writes stored in the tier", |t| t.sets),
            ("deletes_total", "Deletes issued against the tier", |t| t.deletes),
            ("errors_total", "Backend failures and timeouts", |t| t.errors),
            ("promotions_total", "Back-fills after a slower-tier hit", |t| t.promotions),
        ];

        let mut tier_counters = Vec::with_capacity(families.len());
        for (name, help, read) in families {
            let vec = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &["tier"])?;
            registry.register(Box::new(vec.clone()))?;
            tier_counters.push(TierCounter { vec, read });
        }

        let hit_rate = GaugeVec::new(
            Opts::new("hit_rate", "Per-tier hits / lookups").namespace(NAMESPACE),
            &["tier"],
        )?;
        let latency_us = GaugeVec::new(
            Opts::new("latency_microseconds", "Rolling average probe latency").namespace(NAMESPACE),
            &["tier"],
        )?;
        let overall_hit_rate = Gauge::with_opts(
            Opts::new("overall_hit_rate", "Hits / lookups across all tiers").namespace(NAMESPACE),
        )?;
        let l1_entries = IntGauge::with_opts(
            Opts::new("l1_entries", "Entries resident in L1").namespace(NAMESPACE),
        )?;
        let l1_capacity = IntGauge::with_opts(
            Opts::new("l1_capacity", "L1 entry capacity").namespace(NAMESPACE),
        )?;
        let l1_ttl_seconds = Gauge::with_opts(
            Opts::new("l1_ttl_seconds", "Current L1 TTL").namespace(NAMESPACE),
        )?;
        let l1_evictions = IntCounter::with_opts(
            Opts::new("l1_evictions_total", "L1 capacity evictions").namespace(NAMESPACE),
        )?;
        let l1_expirations = IntCounter::with_opts(
            Opts::new("l1_expirations_total", "L1 entries dropped as expired on read")
                .namespace(NAMESPACE),
        )?;
        let warmup_jobs = IntCounterVec::new(
            Opts::new("warmup_jobs_total", "Warm-up jobs by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let warmup_cycles = IntCounter::with_opts(
            Opts::new("warmup_cycles_total", "Completed warm-up cycles").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(latency_us.clone()))?;
        registry.register(Box::new(overall_hit_rate.clone()))?;
        registry.register(Box::new(l1_entries.clone()))?;
        registry.register(Box::new(l1_capacity.clone()))?;
        registry.register(Box::new(l1_ttl_seconds.clone()))?;
        registry.register(Box::new(l1_evictions.clone()))?;
        registry.register(Box::new(l1_expirations.clone()))?;
        registry.register(Box::new(warmup_jobs.clone()))?;
        registry.register(Box::new(warmup_cycles.clone()))?;

        Ok(Self {
            registry,
            tier_counters,
            hit_rate,
            latency_us,
            overall_hit_rate,
            l1_entries,
            l1_capacity,
            l1_ttl_seconds,
            l1_evictions,
            l1_expirations,
            warmup_jobs,
            warmup_cycles,
            last: Mutex::new(Baseline::default()),
        })
    }

    /// Fold a fresh snapshot into the registry
    pub fn update(&self, stats: &CacheStats) {
        let mut last = self.last.lock();

        for tier in CacheTier::ALL {
            let label = tier.label();
            let now = stats.tier(tier);
            let seen = &mut last.tiers[tier.index()];

            for (counter, seen) in self.tier_counters.iter().zip(seen.iter_mut()) {
                let delta = Baseline::advance(seen, (counter.read)(now));
                counter.vec.with_label_values(&[label]).inc_by(delta);
            }
            self.hit_rate.with_label_values(&[label]).set(now.hit_rate);
            self.latency_us
                .with_label_values(&[label])
                .set(now.avg_latency_us);
        }

        self.overall_hit_rate.set(stats.overall_hit_rate);
        self.l1_entries.set(stats.l1_entries as i64);
        self.l1_capacity.set(stats.l1_capacity as i64);
        self.l1_ttl_seconds.set(stats.l1_ttl_secs);
        self.l1_evictions
            .inc_by(Baseline::advance(&mut last.l1_evictions, stats.l1_evictions));
        self.l1_expirations
            .inc_by(Baseline::advance(&mut last.l1_expirations, stats.l1_expirations));
    }

    /// Count the jobs of a finished warm-up cycle
    pub fn record_warmup(&self, report: &WarmupReport) {
        self.warmup_cycles.inc();
        self.warmup_jobs
            .with_label_values(&["succeeded"])
            .inc_by(report.succeeded as u64);
        self.warmup_jobs
            .with_label_values(&["failed"])
            .inc_by(report.failed as u64);
    }

    /// Render the registry in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("metrics output not UTF-8: {}", e)))
    }
}
