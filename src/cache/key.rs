//! Cache Key Derivation
//!
//! Deterministic `namespace:resource[:digest]` keys. Every process that reads
//! or writes a tier must derive keys the same way, so the layout is fixed:
//!
//! ```text
//! base   = "<namespace>:<resource>"
//! params = sorted by name, each rendered as "<name>=<value>;"
//! key    = base                                  (no params)
//!        | base + ":" + md5(params)[..8] in hex  (otherwise)
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;

use md5::{Digest, Md5};

/// Hex characters of the parameter digest kept in the key
const DIGEST_PREFIX_LEN: usize = 8;

/// Builder for a cache key over an unordered parameter set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKey {
    namespace: String,
    resource: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    /// Start a key for `namespace` / `resource`
    pub fn new(namespace: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter. A repeated name keeps the last value.
    pub fn param(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Namespace component
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resource component
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Render the canonical key string
    pub fn encode(&self) -> String {
        let mut key = format!("{}:{}", self.namespace, self.resource);
        if self.params.is_empty() {
            return key;
        }

        // BTreeMap iterates in ascending key order
        let canonical: String = self
            .params
            .iter()
            .map(|(name, value)| format!("{}={};", name, value))
            .collect();

        key.push(':');
        key.push_str(&params_digest(&canonical));
        key
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.encode()
    }
}

/// Derive a cache key from a namespace, resource and unordered parameters.
///
/// Insertion order of `params` never affects the result.
pub fn encode_key<I, K, V>(namespace: &str, resource: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Display,
{
    params
        .into_iter()
        .fold(CacheKey::new(namespace, resource), |key, (name, value)| {
            key.param(name.as_ref(), value)
        })
        .encode()
}

fn params_digest(canonical: &str) -> String {
    let digest = Md5::digest(canonical.as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(DIGEST_PREFIX_LEN);
    hex
}

// =============================================================================
// Tests
// =============================================================================
