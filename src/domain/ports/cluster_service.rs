//! Cluster Service Port
//!
//! Distributed mutual exclusion keyed by (action, scope).

/// Lock action names.
pub mod actions {
    pub const PUSH: &str = "PUSH";
    pub const PULL: &str = "PULL";
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const PURGE: &str = "PURGE";
    pub const SYNCTRIGGERS: &str = "SYNCTRIGGERS";
    pub const ROUTE: &str = "ROUTE";
}

/// Scope used by cluster-wide actions.
pub const COMMON_LOCK_ID: &str = "common";

pub trait ClusterService: Send + Sync {
    /// Try to take the lock. `false` means another worker owns the work.
    fn lock(&self, action: &str, scope: &str) -> bool;

    fn unlock(&self, action: &str, scope: &str);
}
