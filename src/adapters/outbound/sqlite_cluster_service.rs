//! SQLite Cluster Service
//!
//! Implements ClusterService with a lock table in the shared runtime store.
//! A lock is taken by a conditional update that only succeeds when the row
//! is free or its holder's lock has timed out.

use crate::domain::ports::{keys, ClusterService, ParameterStore};
use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT_MS: i64 = 30 * 60 * 1000;

pub struct SqliteClusterService {
    db_path: String,
    server_id: String,
    parameters: Arc<dyn ParameterStore>,
}

impl SqliteClusterService {
    pub fn new(db_path: impl Into<String>, server_id: impl Into<String>, parameters: Arc<dyn ParameterStore>) -> Self {
        Self {
            db_path: db_path.into(),
            server_id: server_id.into(),
            parameters,
        }
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS lock (
                lock_action TEXT NOT NULL,
                scope TEXT NOT NULL,
                locking_server_id TEXT,
                lock_time INTEGER,
                last_locking_server_id TEXT,
                last_lock_time INTEGER,
                PRIMARY KEY (lock_action, scope)
            )",
            [],
        )?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Locking toggle for `action`, falling back to the global switch.
    fn locking_enabled(&self, action: &str) -> bool {
        let global = self.parameters.get_bool(keys::CLUSTER_LOCK_ENABLED, true);
        self.parameters
            .get_bool(&keys::cluster_lock_enabled_for(action), global)
    }

    fn try_lock(&self, action: &str, scope: &str) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp_millis();
        let timeout = self
            .parameters
            .get_i64(keys::CLUSTER_LOCK_TIMEOUT_MS, DEFAULT_LOCK_TIMEOUT_MS);
        conn.execute(
            "INSERT OR IGNORE INTO lock (lock_action, scope) VALUES (?, ?)",
            params![action, scope],
        )?;
        let updated = conn.execute(
            "UPDATE lock SET locking_server_id = ?, lock_time = ?
             WHERE lock_action = ? AND scope = ? AND (lock_time IS NULL OR lock_time < ?)",
            params![self.server_id, now, action, scope, now - timeout],
        )?;
        Ok(updated == 1)
    }

    fn try_unlock(&self, action: &str, scope: &str) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE lock SET locking_server_id = NULL, lock_time = NULL,
                 last_locking_server_id = ?, last_lock_time = ?
             WHERE lock_action = ? AND scope = ? AND locking_server_id = ?",
            params![self.server_id, Utc::now().timestamp_millis(), action, scope, self.server_id],
        )?;
        Ok(updated == 1)
    }
}

impl ClusterService for SqliteClusterService {
    fn lock(&self, action: &str, scope: &str) -> bool {
        if !self.locking_enabled(action) {
            return true;
        }
        match self.try_lock(action, scope) {
            Ok(locked) => {
                if !locked {
                    tracing::debug!("{} lock for {} is held by another server", action, scope);
                }
                locked
            }
            Err(e) => {
                tracing::error!("failed to take {} lock for {}: {:?}", action, scope, e);
                false
            }
        }
    }

    fn unlock(&self, action: &str, scope: &str) {
        if !self.locking_enabled(action) {
            return;
        }
        match self.try_unlock(action, scope) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "{} lock for {} was not held by {}",
                action,
                scope,
                self.server_id
            ),
            Err(e) => tracing::error!("failed to release {} lock for {}: {:?}", action, scope, e),
        }
    }
}
