//! In-Memory Node Repository
//!
//! Implements NodeRepository over DashMaps seeded at startup. Extract times
//! and initial-load flags are updated in place by the push cycle.

use crate::domain::entities::{ChannelWindow, Node, NodeChannel, NodeSecurity};
use crate::domain::ports::NodeRepository;
use crate::domain::value_objects::NodeId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

pub struct MemoryNodeRepository {
    identity: Node,
    targets: Arc<DashMap<NodeId, Node>>,
    security: Arc<DashMap<NodeId, NodeSecurity>>,
    /// Keyed by (node, channel)
    channels: Arc<DashMap<(NodeId, String), NodeChannel>>,
    windows: Arc<DashMap<String, Vec<ChannelWindow>>>,
}

impl MemoryNodeRepository {
    pub fn new(identity: Node) -> Self {
        Self {
            identity,
            targets: Arc::new(DashMap::new()),
            security: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn add_push_target(&self, node: Node) {
        self.targets.insert(node.node_id.clone(), node);
    }

    pub fn set_security(&self, security: NodeSecurity) {
        self.security.insert(security.node_id.clone(), security);
    }

    pub fn set_channel(&self, channel: NodeChannel) {
        self.channels
            .insert((channel.node_id.clone(), channel.channel_id.clone()), channel);
    }

    pub fn add_window(&self, window: ChannelWindow) {
        self.windows
            .entry(window.channel_id.clone())
            .or_default()
            .push(window);
    }

    pub fn channel(&self, node_id: &NodeId, channel_id: &str) -> Option<NodeChannel> {
        self.channels
            .get(&(node_id.clone(), channel_id.to_string()))
            .map(|c| c.value().clone())
    }
}

impl NodeRepository for MemoryNodeRepository {
    fn identity(&self) -> Node {
        self.identity.clone()
    }

    fn push_targets(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .targets
            .iter()
            .filter(|n| n.sync_enabled)
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.as_str().cmp(b.node_id.as_str()));
        nodes
    }

    fn node_security(&self, node_id: &NodeId) -> Option<NodeSecurity> {
        self.security.get(node_id).map(|s| s.value().clone())
    }

    fn clear_initial_load(&self, node_id: &NodeId) {
        if let Some(mut security) = self.security.get_mut(node_id) {
            security.initial_load_enabled = false;
            security.initial_load_time = Some(Utc::now());
        }
    }

    fn node_channels(&self, node_id: &NodeId) -> Vec<NodeChannel> {
        let mut channels: Vec<NodeChannel> = self
            .channels
            .iter()
            .filter(|c| &c.key().0 == node_id)
            .map(|c| c.value().clone())
            .collect();
        channels.sort_by(|a, b| {
            a.processing_order
                .cmp(&b.processing_order)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        channels
    }

    fn channel_windows(&self, channel_id: &str) -> Vec<ChannelWindow> {
        self.windows
            .get(channel_id)
            .map(|w| w.value().clone())
            .unwrap_or_default()
    }

    fn record_extract(&self, node_id: &NodeId, channel_id: &str, time: DateTime<Utc>) {
        if let Some(mut channel) = self
            .channels
            .get_mut(&(node_id.clone(), channel_id.to_string()))
        {
            channel.last_extract_time = Some(time);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn repo() -> MemoryNodeRepository {
        MemoryNodeRepository::new(Node::new("corp", "corp"))
    }

    #[test]
    fn test_push_targets_skip_disabled() {
        let repo = repo();
        repo.add_push_target(Node::new("store-2", "store"));
        repo.add_push_target(Node::new("store-1", "store"));
        let mut disabled = Node::new("store-3", "store");
        disabled.sync_enabled = false;
        repo.add_push_target(disabled);

        let ids: Vec<String> = repo
            .push_targets()
            .into_iter()
            .map(|n| n.node_id.0)
            .collect();
        assert_eq!(ids, vec!["store-1", "store-2"]);
        assert_eq!(repo.identity().node_id, NodeId::new("corp"));
    }

    #[test]
    fn test_channels_sorted_by_processing_order() {
        let repo = repo();
        let node = NodeId::new("store-1");
        repo.set_channel(NodeChannel::new(node.clone(), "audit", 1));
        repo.set_channel(NodeChannel::new(node.clone(), "sales", 2));
        repo.set_channel(NodeChannel::new(NodeId::new("store-2"), "sales", 0));

        let channels = repo.node_channels(&node);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel_id, "audit");
        assert_eq!(channels[1].channel_id, "sales");
    }

    #[test]
    fn test_record_extract() {
        let repo = repo();
        let node = NodeId::new("store-1");
        repo.set_channel(NodeChannel::new(node.clone(), "sales", 1));
        let now = Utc::now();
        repo.record_extract(&node, "sales", now);
        assert_eq!(repo.channel(&node, "sales").unwrap().last_extract_time, Some(now));

        // unknown channel is a no-op
        repo.record_extract(&node, "audit", now);
        assert!(repo.channel(&node, "audit").is_none());
    }

    #[test]
    fn test_clear_initial_load() {
        let repo = repo();
        let node = NodeId::new("store-1");
        repo.set_security(NodeSecurity {
            node_id: node.clone(),
            initial_load_enabled: true,
            initial_load_time: None,
        });
        repo.clear_initial_load(&node);
        let security = repo.node_security(&node).unwrap();
        assert!(!security.initial_load_enabled);
        assert!(security.initial_load_time.is_some());
        assert!(repo.node_security(&NodeId::new("store-9")).is_none());
    }

    #[test]
    fn test_channel_windows() {
        let repo = repo();
        let start = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
        repo.add_window(ChannelWindow::new("sales", start, end));
        assert_eq!(repo.channel_windows("sales").len(), 1);
        assert!(repo.channel_windows("audit").is_empty());
    }
}
