//! Parameter Store Port
//!
//! Key-value runtime parameters with typed accessors.

/// Well-known parameter names.
pub mod keys {
    pub const CLUSTER_LOCK_ENABLED: &str = "cluster.lock.enabled";
    pub const CLUSTER_LOCK_TIMEOUT_MS: &str = "cluster.lock.timeout.ms";
    pub const MAX_ROWS_BEFORE_COMMIT: &str = "dataloader.max.rows.before.commit";
    pub const SLEEP_AFTER_EARLY_COMMIT_MS: &str = "dataloader.sleep.time.after.early.commit";
    pub const IGNORE_MISSING_TABLES: &str = "dataloader.ignore.missing.tables";
    pub const APPLY_CHANGES_ONLY: &str = "dataloader.apply.changes.only";
    pub const PARAMETER_CACHE_TIMEOUT_MS: &str = "parameter.cache.timeout.ms";

    /// Per-action override of `cluster.lock.enabled`.
    pub fn cluster_lock_enabled_for(action: &str) -> String {
        format!("{}.{}", CLUSTER_LOCK_ENABLED, action.to_lowercase())
    }
}

pub trait ParameterStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
            None => default,
        }
    }
}
