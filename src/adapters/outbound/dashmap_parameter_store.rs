//! DashMap Parameter Store
//!
//! Implements ParameterStore over explicitly set values and the process
//! environment. Environment lookups are cached in a DashMap and re-read once
//! an entry is older than the cache timeout.

use crate::domain::ports::ParameterStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cached lookup result.
#[derive(Debug, Clone)]
struct CachedValue {
    value: Option<String>,
    loaded_at: Instant,
}

pub struct DashMapParameterStore {
    values: Arc<DashMap<String, String>>,
    cache: Arc<DashMap<String, CachedValue>>,
    cache_timeout: Duration,
}

impl DashMapParameterStore {
    pub fn new(cache_timeout: Duration) -> Self {
        Self {
            values: Arc::new(DashMap::new()),
            cache: Arc::new(DashMap::new()),
            cache_timeout,
        }
    }

    /// Seed values, typically from the loaded configuration.
    pub fn with_values<I, K, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in values {
            self.values.insert(k.into(), v.into());
        }
        self
    }

    /// Environment variable consulted for `key`:
    /// `cluster.lock.enabled` → `DBRELAY_CLUSTER_LOCK_ENABLED`.
    pub fn env_key(key: &str) -> String {
        let mut name = String::from("DBRELAY_");
        for c in key.chars() {
            if c.is_ascii_alphanumeric() {
                name.push(c.to_ascii_uppercase());
            } else {
                name.push('_');
            }
        }
        name
    }

    /// Drop every cached environment lookup.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl Default for DashMapParameterStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl ParameterStore for DashMapParameterStore {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.values.get(key) {
            return Some(v.value().clone());
        }
        if let Some(cached) = self.cache.get(key) {
            if cached.loaded_at.elapsed() < self.cache_timeout {
                return cached.value.clone();
            }
        }
        let value = std::env::var(Self::env_key(key)).ok();
        self.cache.insert(
            key.to_string(),
            CachedValue {
                value: value.clone(),
                loaded_at: Instant::now(),
            },
        );
        value
    }

    fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
        self.cache.remove(key);
    }
}
