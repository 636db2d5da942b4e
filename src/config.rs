//! Cache Configuration
//!
//! Tunable, process-wide settings for every tier and background loop.
//! Loaded from YAML (durations written as `"30s"`, `"5m"`, `"1h30m"`, ...)
//! and mutated in place by the adaptive controller at runtime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Tier Settings
// =============================================================================

/// Per-tier enablement and TTL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    /// Whether the tier participates in reads and writes
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// TTL applied to writes that do not carry an explicit TTL
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl TierSettings {
    /// Enabled tier with the given TTL
    pub fn enabled(ttl: Duration) -> Self {
        Self { enabled: true, ttl }
    }

    /// Disabled tier (TTL kept for when it is switched back on)
    pub fn disabled(ttl: Duration) -> Self {
        Self {
            enabled: false,
            ttl,
        }
    }
}

/// Tier layout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    /// L1 - in-process LRU
    pub l1: TierSettings,

    /// Maximum number of entries resident in L1
    pub l1_max_entries: usize,

    /// L2 - remote key/value store
    pub l2: TierSettings,

    /// L3 - persistent store
    pub l3: TierSettings,

    /// Upper bound on any single L2/L3 call
    #[serde(with = "duration_str")]
    pub backend_timeout: Duration,

    /// Keys deleted concurrently per batch-delete chunk
    pub batch_delete_chunk: usize,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            l1: TierSettings::enabled(Duration::from_secs(5 * 60)),
            l1_max_entries: 10_000,
            l2: TierSettings::enabled(Duration::from_secs(30 * 60)),
            l3: TierSettings::enabled(Duration::from_secs(24 * 60 * 60)),
            backend_timeout: Duration::from_secs(2),
            batch_delete_chunk: crate::cache::DEFAULT_BATCH_DELETE_CHUNK,
        }
    }
}

// =============================================================================
// Background Loops
// =============================================================================

/// Warm-up scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// Enable periodic warm-up
    pub enabled: bool,

    /// Interval between warm-up cycles
    #[serde(with = "duration_str")]
    pub interval: Duration,

    /// Maximum jobs running at once
    pub max_concurrency: usize,

    /// Run higher-priority jobs first
    pub priority_ordering: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
            max_concurrency: 5,
            priority_ordering: true,
        }
    }
}

/// Adaptive L1 TTL tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Enable the adaptive loop
    pub enabled: bool,

    /// Interval between controller ticks
    #[serde(with = "duration_str")]
    pub interval: Duration,

    /// Hit rate the controller steers toward (reported only)
    pub target_hit_rate: f64,

    /// Below this hit rate the L1 TTL grows
    pub scale_up_threshold: f64,

    /// Above this hit rate the L1 TTL shrinks
    pub scale_down_threshold: f64,

    /// Floor for the L1 TTL
    #[serde(with = "duration_str")]
    pub min_l1_ttl: Duration,

    /// Cap for the L1 TTL
    #[serde(with = "duration_str")]
    pub max_l1_ttl: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            target_hit_rate: 0.8,
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.95,
            min_l1_ttl: Duration::from_secs(30),
            max_l1_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Invalidation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Allow glob-pattern invalidation across tiers
    pub pattern_enabled: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            pattern_enabled: true,
        }
    }
}

/// Stats reporting loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable periodic stats reporting
    pub enabled: bool,

    /// Interval between reports
    #[serde(with = "duration_str")]
    pub report_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Full cache configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tier layout
    pub tiers: TiersConfig,
    /// Warm-up scheduling
    pub warmup: WarmupConfig,
    /// Adaptive TTL tuning
    pub adaptive: AdaptiveConfig,
    /// Invalidation
    pub invalidation: InvalidationConfig,
    /// Stats reporting
    pub metrics: MetricsConfig,
}

impl CacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tiers.l1_max_entries == 0 {
            return Err(Error::Config("tiers.l1_max_entries must be > 0".into()));
        }
        if self.tiers.batch_delete_chunk == 0 {
            return Err(Error::Config("tiers.batch_delete_chunk must be > 0".into()));
        }
        if self.tiers.backend_timeout.is_zero() {
            return Err(Error::Config("tiers.backend_timeout must be > 0".into()));
        }
        if self.warmup.interval.is_zero() {
            return Err(Error::Config("warmup.interval must be > 0".into()));
        }
        if self.warmup.max_concurrency == 0 {
            return Err(Error::Config("warmup.max_concurrency must be > 0".into()));
        }
        if self.metrics.report_interval.is_zero() {
            return Err(Error::Config("metrics.report_interval must be > 0".into()));
        }

        let adaptive = &self.adaptive;
        if adaptive.interval.is_zero() {
            return Err(Error::Config("adaptive.interval must be > 0".into()));
        }
        for (name, value) in [
            ("target_hit_rate", adaptive.target_hit_rate),
            ("scale_up_threshold", adaptive.scale_up_threshold),
            ("scale_down_threshold", adaptive.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "adaptive.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if adaptive.scale_up_threshold > adaptive.scale_down_threshold {
            return Err(Error::Config(format!(
                "adaptive.scale_up_threshold ({}) exceeds scale_down_threshold ({})",
                adaptive.scale_up_threshold, adaptive.scale_down_threshold
            )));
        }
        if adaptive.min_l1_ttl > adaptive.max_l1_ttl {
            return Err(Error::Config(format!(
                "adaptive.min_l1_ttl ({:?}) exceeds max_l1_ttl ({:?})",
                adaptive.min_l1_ttl, adaptive.max_l1_ttl
            )));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like "500ms", "30s", "5m", "1h30m" or "1d".
///
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut unit_buf = String::new();

    let mut flush = |num_buf: &mut String, unit_buf: &mut String| -> Result<()> {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        let multiplier = match unit_buf.to_ascii_lowercase().as_str() {
            "ms" => 1,
            "s" | "" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total_ms = num
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
        num_buf.clear();
        unit_buf.clear();
        Ok(())
    };

    for c in s.chars() {
        if c.is_ascii_digit() {
            if !unit_buf.is_empty() {
                flush(&mut num_buf, &mut unit_buf)?;
            }
            num_buf.push(c);
        } else if c.is_ascii_alphabetic() {
            if num_buf.is_empty() {
                return Err(Error::DurationParse(format!(
                    "unit without number in duration: {}",
                    s
                )));
            }
            unit_buf.push(c);
        } else {
            return Err(Error::DurationParse(format!(
                "unexpected character '{}' in duration: {}",
                c, s
            )));
        }
    }

    if !num_buf.is_empty() {
        flush(&mut num_buf, &mut unit_buf)?;
    }

    if total_ms == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration the way `parse_duration` reads it back
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 != 0 {
        format!("{}ms", ms)
    } else {
        format!("{}s", ms / 1_000)
    }
}

/// Serde adapter for human-readable duration strings
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
