//! Node Repository Port
//!
//! Topology, per-node channel policy and security flags.

use crate::domain::entities::{ChannelWindow, Node, NodeChannel, NodeSecurity};
use crate::domain::value_objects::NodeId;
use chrono::{DateTime, Utc};

pub trait NodeRepository: Send + Sync {
    /// The node this process runs as.
    fn identity(&self) -> Node;

    /// Nodes this node pushes to.
    fn push_targets(&self) -> Vec<Node>;

    fn node_security(&self, node_id: &NodeId) -> Option<NodeSecurity>;

    /// Reset the initial-load flag once the reload request is queued.
    fn clear_initial_load(&self, node_id: &NodeId);

    fn node_channels(&self, node_id: &NodeId) -> Vec<NodeChannel>;

    fn channel_windows(&self, channel_id: &str) -> Vec<ChannelWindow>;

    fn record_extract(&self, node_id: &NodeId, channel_id: &str, time: DateTime<Utc>);
}
