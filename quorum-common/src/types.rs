pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;
pub type EntryId = u64;

use crate::config::RaftConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

/// Static description of a cluster as seen from one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,         // This member's identity
    pub nodes: Vec<NodeAddress>, // Every member, self included
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ClusterConfig {
    /// Members other than this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeAddress> {
        self.nodes.iter().filter(move |n| n.node_id != self.node_id)
    }

    pub fn is_member(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == node_id)
    }
}
