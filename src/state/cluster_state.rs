//! The cluster state value.
//!
//! A [`ClusterState`] holds a dense per-type vector of node states plus the
//! global predicates every node needs: version, whether the cluster is up,
//! and the distribution bit count. Indices past the end of a vector are
//! Down, so a missing node and a Down node are indistinguishable.
//!
//! The compact text form is used in logs and tests:
//!
//! ```text
//! version:3 bits:14 distributor:4 .1.s:d storage:4 .0.s:m .2.s:i .2.i:0.5
//! ```

use super::node::{Node, NodeType};
use super::node_state::{NodeState, State};
use crate::error::{ControllerError, Result};
use std::fmt;
use std::str::FromStr;

/// Distribution bit count a fresh cluster state carries.
pub const DEFAULT_DISTRIBUTION_BITS: u32 = 16;

#[derive(Debug, Clone)]
pub struct ClusterState {
    version: u32,
    state: State,
    distribution_bits: u32,
    distributors: Vec<NodeState>,
    storage: Vec<NodeState>,
}

impl ClusterState {
    /// An unversioned state with the cluster down and no nodes.
    pub fn empty() -> Self {
        Self {
            version: 0,
            state: State::Down,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            distributors: Vec::new(),
            storage: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Global cluster state, either Up or Down.
    pub fn cluster_state(&self) -> State {
        self.state
    }

    pub fn set_cluster_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn distribution_bits(&self) -> u32 {
        self.distribution_bits
    }

    pub fn set_distribution_bits(&mut self, bits: u32) {
        self.distribution_bits = bits;
    }

    fn nodes(&self, node_type: NodeType) -> &Vec<NodeState> {
        match node_type {
            NodeType::Distributor => &self.distributors,
            NodeType::Storage => &self.storage,
        }
    }

    fn nodes_mut(&mut self, node_type: NodeType) -> &mut Vec<NodeState> {
        match node_type {
            NodeType::Distributor => &mut self.distributors,
            NodeType::Storage => &mut self.storage,
        }
    }

    /// Number of node slots up to and including the last node that is not
    /// in default Down state.
    pub fn node_count(&self, node_type: NodeType) -> usize {
        let nodes = self.nodes(node_type);
        nodes
            .iter()
            .rposition(|ns| !ns.is_default_down())
            .map_or(0, |pos| pos + 1)
    }

    /// State of `node`; Down if the node is not present.
    pub fn node_state(&self, node: Node) -> NodeState {
        self.nodes(node.node_type())
            .get(usize::from(node.index()))
            .cloned()
            .unwrap_or_else(|| NodeState::new(node.node_type(), State::Down))
    }

    /// Borrowing variant of [`ClusterState::node_state`] for present nodes.
    pub fn node_state_ref(&self, node: Node) -> Option<&NodeState> {
        self.nodes(node.node_type()).get(usize::from(node.index()))
    }

    pub fn set_node_state(&mut self, node: Node, state: NodeState) {
        let node_type = node.node_type();
        let index = usize::from(node.index());
        let nodes = self.nodes_mut(node_type);
        if nodes.len() <= index {
            nodes.resize_with(index + 1, || NodeState::new(node_type, State::Down));
        }
        nodes[index] = state;
    }

    /// Iterate over every node slot of a type, including Down slots.
    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = (Node, &NodeState)> {
        self.nodes(node_type)
            .iter()
            .enumerate()
            .map(move |(i, ns)| (Node::new(node_type, i as u16), ns))
    }

    /// Copy of this state stamped with `version`.
    pub fn cloned_with_version(&self, version: u32) -> Self {
        let mut copy = self.clone();
        copy.version = version;
        copy
    }

    /// Structural similarity used for publish hysteresis: version and init
    /// progress are ignored.
    pub fn similar_to_ignoring_init_progress(&self, other: &ClusterState) -> bool {
        if self.state != other.state || self.distribution_bits != other.distribution_bits {
            return false;
        }
        NodeType::ALL.iter().all(|&node_type| {
            let count = self.nodes(node_type).len().max(other.nodes(node_type).len());
            (0..count).all(|i| {
                let node = Node::new(node_type, i as u16);
                self.node_state(node)
                    .similar_to_ignoring_init_progress(&other.node_state(node))
            })
        })
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for ClusterState {
    fn eq(&self, other: &Self) -> bool {
        if self.version != other.version
            || self.state != other.state
            || self.distribution_bits != other.distribution_bits
        {
            return false;
        }
        NodeType::ALL.iter().all(|&node_type| {
            let count = self.nodes(node_type).len().max(other.nodes(node_type).len());
            (0..count).all(|i| {
                let node = Node::new(node_type, i as u16);
                self.node_state(node) == other.node_state(node)
            })
        })
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        if self.version != 0 {
            out.push_str(&format!(" version:{}", self.version));
        }
        if self.state != State::Up {
            out.push_str(&format!(" cluster:{}", self.state.code()));
        }
        if self.distribution_bits != DEFAULT_DISTRIBUTION_BITS {
            out.push_str(&format!(" bits:{}", self.distribution_bits));
        }
        for node_type in NodeType::ALL {
            let count = self.node_count(node_type);
            if count == 0 {
                continue;
            }
            out.push_str(&format!(" {}:{}", node_type, count));
            for (i, ns) in self.nodes(node_type).iter().take(count).enumerate() {
                ns.write_compact(&format!(".{}.", i), &mut out);
            }
        }
        f.write_str(out.trim_start())
    }
}

impl FromStr for ClusterState {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        let mut cluster = ClusterState {
            state: State::Up,
            ..ClusterState::empty()
        };
        let mut current_type: Option<NodeType> = None;

        for token in s.split_whitespace() {
            let (key, value) = token.split_once(':').ok_or_else(|| {
                ControllerError::InvalidState(format!("token '{}' lacks a ':'", token))
            })?;
            let parse_u32 = |v: &str| {
                v.parse::<u32>().map_err(|_| {
                    ControllerError::InvalidState(format!("invalid number in '{}'", token))
                })
            };

            if let Some(rest) = key.strip_prefix('.') {
                let node_type = current_type.ok_or_else(|| {
                    ControllerError::InvalidState(format!(
                        "node field '{}' before any node type",
                        token
                    ))
                })?;
                let (index, field) = rest.split_once('.').ok_or_else(|| {
                    ControllerError::InvalidState(format!("malformed node field '{}'", token))
                })?;
                let index: u16 = index.parse().map_err(|_| {
                    ControllerError::InvalidState(format!("invalid node index in '{}'", token))
                })?;
                let node = Node::new(node_type, index);
                let mut ns = cluster.node_state(node);
                ns.apply_compact_field(field, value)?;
                cluster.set_node_state(node, ns);
                continue;
            }

            match key {
                "version" => cluster.version = parse_u32(value)?,
                "bits" => cluster.distribution_bits = parse_u32(value)?,
                "cluster" => cluster.state = State::from_code(value)?,
                "distributor" | "storage" => {
                    let node_type = if key == "distributor" {
                        NodeType::Distributor
                    } else {
                        NodeType::Storage
                    };
                    // Node indexes are u16.
                    let count = parse_u32(value)?;
                    if count > u32::from(u16::MAX) + 1 {
                        return Err(ControllerError::InvalidState(format!(
                            "node count out of range in '{}'",
                            token
                        )));
                    }
                    *cluster.nodes_mut(node_type) = (0..count)
                        .map(|_| NodeState::new(node_type, State::Up))
                        .collect();
                    current_type = Some(node_type);
                }
                other => {
                    return Err(ControllerError::InvalidState(format!(
                        "unknown cluster state key '{}'",
                        other
                    )))
                }
            }
        }
        Ok(cluster)
    }
}
