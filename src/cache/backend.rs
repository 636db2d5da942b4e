//! L2/L3 Backends
//!
//! Narrow three-operation interface over a remote key/value store (L2, e.g.
//! Redis) or a persistent store (L3, e.g. a SQL table). Values cross this
//! boundary as opaque bytes; encoding is the layered cache's job.
//!
//! # Design
//!
//! - `Ok(None)` from `get` is a miss, `Err` is a transport failure
//! - Pluggable: the engine only holds `Arc<dyn CacheBackend>`
//! - `InMemoryBackend` honours TTL and is used for tests and local runs

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Storage backend behind L2 or L3
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a value; `Ok(None)` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value for `ttl`
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove a value; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key matching a glob pattern, returning how many went.
    ///
    /// Backends without server-side scanning keep the default no-op.
    async fn delete_pattern(&self, _pattern: &str) -> Result<u64> {
        Ok(0)
    }

    /// Short name used in logs
    fn name(&self) -> &str;
}

/// In-memory backend statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendStats {
    /// Live (possibly expired, not yet purged) objects
    pub object_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Instant,
}

/// In-memory backend with TTL
/// Uses DashMap for sharded concurrent access instead of a single RwLock
pub struct InMemoryBackend {
    name: String,
    storage: DashMap<String, StoredValue>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: DashMap::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Whether a live (unexpired) value is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.storage
            .get(key)
            .map(|v| Instant::now() <= v.expires_at)
            .unwrap_or(false)
    }

    /// Raw stored bytes, ignoring expiry
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.storage.get(key).map(|v| v.data.clone())
    }

    /// Remaining TTL of a stored value
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.storage
            .get(key)
            .map(|v| v.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Operation counters
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            object_count: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let expired = match self.storage.get(key) {
            Some(value) if Instant::now() <= value.expires_at => {
                return Ok(Some(value.data.clone()))
            }
            Some(_) => true,
            None => false,
        };

        // Guard from the lookup is dropped before removing
        if expired {
            self.storage
                .remove_if(key, |_, v| Instant::now() > v.expires_at);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.storage.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let matcher =
            glob::Pattern::new(pattern).map_err(|e| Error::InvalidPattern(e.to_string()))?;

        let before = self.storage.len();
        self.storage.retain(|key, _| !matcher.matches(key));
        let removed = before.saturating_sub(self.storage.len()) as u64;

        self.deletes.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Tests
// =============================================================================
