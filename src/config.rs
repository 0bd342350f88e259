use crate::domain::entities::Node;
use crate::domain::ports::keys;
use crate::domain::value_objects::{DetectConflict, ResolveConflict};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("push node '{0}' must look like id@url")]
    InvalidPushNode(String),

    #[error("channel '{0}' must look like id or id:order")]
    InvalidChannel(String),

    #[error("unknown conflict {kind} strategy '{name}'")]
    UnknownStrategy { kind: &'static str, name: String },
}

/// A node this node pushes to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushNodeConfig {
    pub node_id: String,
    pub sync_url: String,
}

impl PushNodeConfig {
    pub fn to_node(&self, group: &str) -> Node {
        Node::new(self.node_id.clone(), group).with_sync_url(self.sync_url.clone())
    }
}

/// A channel and its processing order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,
    pub processing_order: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Identity
    pub node_id: String,
    pub node_group_id: String,
    pub sync_url: String,
    pub listen_addr: String,

    // Storage
    pub runtime_db_path: String,
    pub target_db_path: String,

    // Push job
    pub push_interval_secs: u64,
    pub push_nodes: Vec<PushNodeConfig>,
    pub push_node_group_id: String,
    pub channels: Vec<ChannelConfig>,

    // Cluster locking
    pub cluster_lock_enabled: bool,
    pub cluster_lock_timeout_ms: i64,
    pub parameter_cache_timeout_ms: u64,

    // Data loader
    pub max_rows_before_commit: usize,
    pub commit_sleep_ms: u64,
    pub ignore_missing_tables: bool,
    pub apply_changes_only: bool,
    pub detect_conflict: DetectConflict,
    pub resolve_conflict: ResolveConflict,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            node_group_id: "default".to_string(),
            sync_url: "http://localhost:31415/sync".to_string(),
            listen_addr: "0.0.0.0:31415".to_string(),
            runtime_db_path: "relay.db".to_string(),
            target_db_path: "target.db".to_string(),
            push_interval_secs: 60,
            push_nodes: Vec::new(),
            push_node_group_id: "default".to_string(),
            channels: vec![ChannelConfig {
                channel_id: "default".to_string(),
                processing_order: 1,
            }],
            cluster_lock_enabled: true,
            cluster_lock_timeout_ms: 30 * 60 * 1000,
            parameter_cache_timeout_ms: 600_000,
            max_rows_before_commit: 10_000,
            commit_sleep_ms: 0,
            ignore_missing_tables: false,
            apply_changes_only: false,
            detect_conflict: DetectConflict::UsePkData,
            resolve_conflict: ResolveConflict::Fallback,
            debug: false,
        }
    }
}

impl Config {
    /// Values seeded into the parameter store at startup.
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            (keys::CLUSTER_LOCK_ENABLED, self.cluster_lock_enabled.to_string()),
            (keys::CLUSTER_LOCK_TIMEOUT_MS, self.cluster_lock_timeout_ms.to_string()),
            (keys::MAX_ROWS_BEFORE_COMMIT, self.max_rows_before_commit.to_string()),
            (keys::SLEEP_AFTER_EARLY_COMMIT_MS, self.commit_sleep_ms.to_string()),
            (keys::IGNORE_MISSING_TABLES, self.ignore_missing_tables.to_string()),
            (keys::APPLY_CHANGES_ONLY, self.apply_changes_only.to_string()),
            (keys::PARAMETER_CACHE_TIMEOUT_MS, self.parameter_cache_timeout_ms.to_string()),
        ]
    }
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Parse `id@url,id@url`.
pub fn parse_push_nodes(value: &str) -> Result<Vec<PushNodeConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('@') {
            Some((id, url)) if !id.trim().is_empty() && !url.trim().is_empty() => Ok(PushNodeConfig {
                node_id: id.trim().to_string(),
                sync_url: url.trim().to_string(),
            }),
            _ => Err(ConfigError::InvalidPushNode(entry.to_string())),
        })
        .collect()
}

/// Parse `id:order,id`; a missing order follows list position.
pub fn parse_channels(value: &str) -> Result<Vec<ChannelConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, entry)| {
            let (id, order) = match entry.split_once(':') {
                Some((id, order)) => (
                    id.trim(),
                    order
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidChannel(entry.to_string()))?,
                ),
                None => (entry, i as i32 + 1),
            };
            if id.is_empty() {
                return Err(ConfigError::InvalidChannel(entry.to_string()));
            }
            Ok(ChannelConfig {
                channel_id: id.to_string(),
                processing_order: order,
            })
        })
        .collect()
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let node_id = std::env::var("DBRELAY_NODE_ID").unwrap_or(defaults.node_id);

    let node_group_id = std::env::var("DBRELAY_NODE_GROUP_ID").unwrap_or(defaults.node_group_id);

    let sync_url = std::env::var("DBRELAY_SYNC_URL").unwrap_or(defaults.sync_url);

    let listen_addr = std::env::var("DBRELAY_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

    let runtime_db_path = std::env::var("DBRELAY_RUNTIME_DB_PATH").unwrap_or(defaults.runtime_db_path);

    let target_db_path = std::env::var("DBRELAY_TARGET_DB_PATH").unwrap_or(defaults.target_db_path);

    let push_interval_secs = std::env::var("DBRELAY_PUSH_INTERVAL_SECS")
        .unwrap_or_else(|_| "60".to_string())
        .parse()
        .unwrap_or(60);

    let push_nodes = match std::env::var("DBRELAY_PUSH_NODES") {
        Ok(v) => parse_push_nodes(&v)?,
        Err(_) => Vec::new(),
    };

    let push_node_group_id =
        std::env::var("DBRELAY_PUSH_NODE_GROUP_ID").unwrap_or(defaults.push_node_group_id);

    let channels = match std::env::var("DBRELAY_CHANNELS") {
        Ok(v) => parse_channels(&v)?,
        Err(_) => defaults.channels,
    };

    // Cluster locking
    let cluster_lock_enabled = flag("DBRELAY_CLUSTER_LOCK_ENABLED", true);

    let cluster_lock_timeout_ms = std::env::var("DBRELAY_CLUSTER_LOCK_TIMEOUT_MS")
        .unwrap_or_else(|_| "1800000".to_string())
        .parse()
        .unwrap_or(defaults.cluster_lock_timeout_ms);

    let parameter_cache_timeout_ms = std::env::var("DBRELAY_PARAMETER_CACHE_TIMEOUT_MS")
        .unwrap_or_else(|_| "600000".to_string())
        .parse()
        .unwrap_or(defaults.parameter_cache_timeout_ms);

    // Data loader
    let max_rows_before_commit = std::env::var("DBRELAY_MAX_ROWS_BEFORE_COMMIT")
        .unwrap_or_else(|_| "10000".to_string())
        .parse()
        .unwrap_or(defaults.max_rows_before_commit);

    let commit_sleep_ms = std::env::var("DBRELAY_COMMIT_SLEEP_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    let ignore_missing_tables = flag("DBRELAY_IGNORE_MISSING_TABLES", false);
    let apply_changes_only = flag("DBRELAY_APPLY_CHANGES_ONLY", false);

    let detect_conflict = match std::env::var("DBRELAY_DETECT_CONFLICT") {
        Ok(name) => DetectConflict::from_name(&name).ok_or(ConfigError::UnknownStrategy {
            kind: "detect",
            name,
        })?,
        Err(_) => defaults.detect_conflict,
    };

    let resolve_conflict = match std::env::var("DBRELAY_RESOLVE_CONFLICT") {
        Ok(name) => ResolveConflict::from_name(&name).ok_or(ConfigError::UnknownStrategy {
            kind: "resolve",
            name,
        })?,
        Err(_) => defaults.resolve_conflict,
    };

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        node_id,
        node_group_id,
        sync_url,
        listen_addr,
        runtime_db_path,
        target_db_path,
        push_interval_secs,
        push_nodes,
        push_node_group_id,
        channels,
        cluster_lock_enabled,
        cluster_lock_timeout_ms,
        parameter_cache_timeout_ms,
        max_rows_before_commit,
        commit_sleep_ms,
        ignore_missing_tables,
        apply_changes_only,
        detect_conflict,
        resolve_conflict,
        debug,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.node_id, "node-1");
        assert_eq!(cfg.push_interval_secs, 60);
        assert!(cfg.push_nodes.is_empty());
        assert!(cfg.cluster_lock_enabled);
        assert_eq!(cfg.max_rows_before_commit, 10_000);
        assert_eq!(cfg.detect_conflict, DetectConflict::UsePkData);
        assert_eq!(cfg.resolve_conflict, ResolveConflict::Fallback);
    }

    #[test]
    fn test_parse_push_nodes() {
        let nodes = parse_push_nodes("store-1@http://a:31415/sync, store-2@http://b/sync").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].node_id, "store-2");
        assert_eq!(nodes[1].sync_url, "http://b/sync");
        assert_eq!(nodes[0].to_node("store").node_group_id, "store");

        assert!(parse_push_nodes("").unwrap().is_empty());
        assert_eq!(
            parse_push_nodes("store-1"),
            Err(ConfigError::InvalidPushNode("store-1".to_string()))
        );
        assert!(parse_push_nodes("@http://x").is_err());
    }

    #[test]
    fn test_parse_channels() {
        let channels = parse_channels("sales:2,audit").unwrap();
        assert_eq!(channels[0].channel_id, "sales");
        assert_eq!(channels[0].processing_order, 2);
        assert_eq!(channels[1].processing_order, 2);
        assert!(parse_channels("sales:x").is_err());
    }

    #[test]
    fn test_parameters_carry_loader_settings() {
        let cfg = Config {
            max_rows_before_commit: 5,
            cluster_lock_enabled: false,
            ..Config::default()
        };
        let params = cfg.parameters();
        assert!(params.contains(&(keys::MAX_ROWS_BEFORE_COMMIT, "5".to_string())));
        assert!(params.contains(&(keys::CLUSTER_LOCK_ENABLED, "false".to_string())));
    }

    #[test]
    fn test_load_config_from_env() {
        std::env::set_var("DBRELAY_NODE_ID", "corp");
        std::env::set_var("DBRELAY_PUSH_NODES", "store-1@http://store-1/sync");
        std::env::set_var("DBRELAY_APPLY_CHANGES_ONLY", "1");
        std::env::set_var("DBRELAY_MAX_ROWS_BEFORE_COMMIT", "250");
        std::env::set_var("DBRELAY_DETECT_CONFLICT", "USE_OLD_DATA");
        std::env::set_var("DBRELAY_RESOLVE_CONFLICT", "manual");

        let cfg = load_config().unwrap();
        assert_eq!(cfg.node_id, "corp");
        assert_eq!(cfg.push_nodes[0].node_id, "store-1");
        assert!(cfg.apply_changes_only);
        assert_eq!(cfg.max_rows_before_commit, 250);
        assert_eq!(cfg.detect_conflict, DetectConflict::UseOldData);
        assert_eq!(cfg.resolve_conflict, ResolveConflict::Manual);

        std::env::set_var("DBRELAY_RESOLVE_CONFLICT", "sometimes");
        assert!(load_config().is_err());

        for name in [
            "DBRELAY_NODE_ID",
            "DBRELAY_PUSH_NODES",
            "DBRELAY_APPLY_CHANGES_ONLY",
            "DBRELAY_MAX_ROWS_BEFORE_COMMIT",
            "DBRELAY_DETECT_CONFLICT",
            "DBRELAY_RESOLVE_CONFLICT",
        ] {
            std::env::remove_var(name);
        }
    }
}
