//! Node identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two kinds of content nodes a controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Routes operations and owns bucket ownership decisions.
    Distributor,
    /// Stores documents.
    Storage,
}

impl NodeType {
    /// Both node types, in state serialization order.
    pub const ALL: [NodeType; 2] = [NodeType::Distributor, NodeType::Storage];

    /// Name used in logs and the compact state format.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Distributor => "distributor",
            NodeType::Storage => "storage",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node identity: type plus configured index. Never changes once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    node_type: NodeType,
    index: u16,
}

impl Node {
    pub fn new(node_type: NodeType, index: u16) -> Self {
        Self { node_type, index }
    }

    pub fn distributor(index: u16) -> Self {
        Self::new(NodeType::Distributor, index)
    }

    pub fn storage(index: u16) -> Self {
        Self::new(NodeType::Storage, index)
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn index(&self) -> u16 {
        self.index
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_type, self.index)
    }
}
