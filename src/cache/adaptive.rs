//! Adaptive Controller
//!
//! Periodically nudges the L1 TTL toward the configured hit-rate band:
//! a poor hit rate keeps entries longer, a very high one shortens their
//! life to limit staleness.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::layered::LayeredCache;
use super::CacheValue;

/// TTL grows by 6/5 when the hit rate is below the scale-up threshold
const SCALE_UP: (u32, u32) = (6, 5);

/// TTL shrinks by 4/5 when the hit rate is above the scale-down threshold
const SCALE_DOWN: (u32, u32) = (4, 5);

/// Outcome of one controller tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdaptiveDecision {
    /// Adaptive mode is off
    Disabled,
    /// No lookups recorded yet
    NoData,
    /// L1 TTL increased
    ScaledUp { from: Duration, to: Duration },
    /// L1 TTL decreased
    ScaledDown { from: Duration, to: Duration },
    /// Hit rate inside the band, or TTL already at its bound
    Unchanged { hit_rate: f64 },
}

/// Adaptive L1 TTL controller
pub struct AdaptiveController<V> {
    cache: Arc<LayeredCache<V>>,
}

impl<V: CacheValue> AdaptiveController<V> {
    /// Create a controller over a cache
    pub fn new(cache: Arc<LayeredCache<V>>) -> Self {
        Self { cache }
    }

    /// Evaluate the hit rate once and retune the L1 TTL.
    ///
    /// The TTL is read and written under one config write lock, so the next
    /// `set` sees the new value.
    pub fn tick(&self) -> AdaptiveDecision {
        let stats = self.cache.stats_recorder();

        let (decision, hit_rate) = self.cache.update_config(|config| {
            let adaptive = &config.adaptive;
            if !adaptive.enabled {
                return (AdaptiveDecision::Disabled, 0.0);
            }

            let total = stats.total_requests();
            if total == 0 {
                return (AdaptiveDecision::NoData, 0.0);
            }
            let hit_rate = stats.total_hits() as f64 / total as f64;

            let from = config.tiers.l1.ttl;
            let (min, max) = (adaptive.min_l1_ttl, adaptive.max_l1_ttl);

            let decision = if hit_rate < adaptive.scale_up_threshold {
                let to = (from * SCALE_UP.0 / SCALE_UP.1).max(min).min(max);
                if to > from {
                    AdaptiveDecision::ScaledUp { from, to }
                } else {
                    AdaptiveDecision::Unchanged { hit_rate }
                }
            } else if hit_rate > adaptive.scale_down_threshold {
                let to = (from * SCALE_DOWN.0 / SCALE_DOWN.1).max(min).min(max);
                if to < from {
                    AdaptiveDecision::ScaledDown { from, to }
                } else {
                    AdaptiveDecision::Unchanged { hit_rate }
                }
            } else {
                AdaptiveDecision::Unchanged { hit_rate }
            };

            if let AdaptiveDecision::ScaledUp { to, .. } | AdaptiveDecision::ScaledDown { to, .. } =
                decision
            {
                config.tiers.l1.ttl = to;
            }
            (decision, hit_rate)
        });

        match decision {
            AdaptiveDecision::ScaledUp { from, to } => {
                let capacity = self.cache.l1().capacity();
                info!(hit_rate, ?from, ?to, "Low hit rate, increased L1 TTL");
                // Capacity is fixed at construction; the suggestion is informational
                debug!(
                    capacity,
                    suggested = capacity * SCALE_UP.0 as usize / SCALE_UP.1 as usize,
                    "L1 capacity would grow under a resizable store"
                );
            }
            AdaptiveDecision::ScaledDown { from, to } => {
                info!(hit_rate, ?from, ?to, "High hit rate, decreased L1 TTL");
            }
            AdaptiveDecision::Unchanged { hit_rate } => {
                debug!(hit_rate, "Hit rate within band, L1 TTL unchanged");
            }
            AdaptiveDecision::NoData => debug!("No lookups recorded yet, skipping tick"),
            AdaptiveDecision::Disabled => {}
        }

        decision
    }

    /// Run the controller loop until `shutdown` fires
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let config = self.cache.config().adaptive;
        if !config.enabled {
            info!("Adaptive controller disabled");
            return;
        }

        info!(
            interval = ?config.interval,
            target_hit_rate = config.target_hit_rate,
            "Starting adaptive controller"
        );

        let period = config.interval.max(Duration::from_millis(1));
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Adaptive controller shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.tick();
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
