//! Stats Reporter
//!
//! Background loop that snapshots the cache on a fixed interval, logs a
//! one-line summary and feeds the Prometheus exporter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use super::exporter::MetricsExporter;
use crate::cache::{CacheStats, CacheValue, LayeredCache, WarmupCoordinator};
use crate::config::MetricsConfig;

/// Periodic stats reporter
pub struct StatsReporter<V> {
    cache: Arc<LayeredCache<V>>,
    exporter: Option<Arc<MetricsExporter>>,
    warmup: Option<Arc<WarmupCoordinator>>,
    /// Last warm-up cycle already exported
    seen_cycle: Mutex<Option<Uuid>>,
    config: MetricsConfig,
}

impl<V: CacheValue> StatsReporter<V> {
    pub fn new(cache: Arc<LayeredCache<V>>, config: MetricsConfig) -> Self {
        Self {
            cache,
            exporter: None,
            warmup: None,
            seen_cycle: Mutex::new(None),
            config,
        }
    }

    /// Also push every snapshot into a Prometheus exporter
    pub fn with_exporter(mut self, exporter: Arc<MetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Also export the outcome of each finished warm-up cycle
    pub fn with_warmup(mut self, warmup: Arc<WarmupCoordinator>) -> Self {
        self.warmup = Some(warmup);
        self
    }

    /// Take one snapshot, export and log it
    pub fn report(&self) -> CacheStats {
        let stats = self.cache.get_stats();
        if let Some(exporter) = &self.exporter {
            exporter.update(&stats);
            self.export_warmup(exporter);
        }

        info!(
            requests = stats.total_requests,
            hit_rate = %format!("{:.3}", stats.overall_hit_rate),
            l1_hits = stats.l1.hits,
            l2_hits = stats.l2.hits,
            l3_hits = stats.l3.hits,
            l2_errors = stats.l2.errors,
            l3_errors = stats.l3.errors,
            l1_entries = stats.l1_entries,
            l1_ttl_secs = stats.l1_ttl_secs,
            "Cache stats"
        );
        stats
    }

    fn export_warmup(&self, exporter: &MetricsExporter) {
        let Some(report) = self.warmup.as_ref().and_then(|w| w.last_report()) else {
            return;
        };
        let mut seen = self.seen_cycle.lock();
        if *seen != Some(report.cycle_id) {
            exporter.record_warmup(&report);
            *seen = Some(report.cycle_id);
        }
    }

    /// Report on every interval until `shutdown` fires
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Stats reporting disabled");
            return;
        }

        let period = self.config.report_interval.max(Duration::from_millis(1));
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stats reporter shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.report();
                }
            }
        }
    }
}
