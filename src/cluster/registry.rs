//! The node registry: sole owner of every [`NodeInfo`].
//!
//! Records live in one dense slot vector per node type, indexed by node
//! index. Everything else refers to nodes by [`Node`] value, never by
//! pointer.

use super::distribution::Distribution;
use super::node_info::NodeInfo;
use crate::state::{Node, NodeState, NodeType, State};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// A node as listed in configuration. Each index is both a distributor and
/// a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredNode {
    pub index: u16,
    #[serde(default)]
    pub retired: bool,
}

impl ConfiguredNode {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            retired: false,
        }
    }

    pub fn retired(index: u16) -> Self {
        Self {
            index,
            retired: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeRegistry {
    cluster_name: String,
    distribution: Distribution,
    configured: BTreeMap<u16, ConfiguredNode>,
    distributors: Vec<Option<NodeInfo>>,
    storage: Vec<Option<NodeInfo>>,
}

impl NodeRegistry {
    pub fn new(
        cluster_name: impl Into<String>,
        nodes: &[ConfiguredNode],
        distribution: Distribution,
    ) -> Self {
        let mut registry = Self {
            cluster_name: cluster_name.into(),
            distribution: Distribution::default(),
            configured: BTreeMap::new(),
            distributors: Vec::new(),
            storage: Vec::new(),
        };
        registry.set_nodes(nodes, distribution);
        registry
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn configured_nodes(&self) -> &BTreeMap<u16, ConfiguredNode> {
        &self.configured
    }

    /// Apply a new node set. New nodes get fresh records, removed nodes are
    /// dropped and returned, and surviving nodes keep their bookkeeping
    /// with the retired flag refreshed.
    pub fn set_nodes(&mut self, nodes: &[ConfiguredNode], distribution: Distribution) -> Vec<Node> {
        let wanted: BTreeMap<u16, ConfiguredNode> =
            nodes.iter().map(|n| (n.index, *n)).collect();
        let mut removed = Vec::new();

        for node_type in NodeType::ALL {
            let slots = self.slots_mut(node_type);
            for (index, slot) in slots.iter_mut().enumerate() {
                let keep = wanted.contains_key(&(index as u16));
                if !keep {
                    if let Some(info) = slot.take() {
                        removed.push(info.node());
                    }
                }
            }
            for configured in wanted.values() {
                let index = usize::from(configured.index);
                if slots.len() <= index {
                    slots.resize_with(index + 1, || None);
                }
                let slot = &mut slots[index];
                if let Some(info) = slot {
                    info.set_configured_retired(configured.retired);
                } else {
                    *slot = Some(NodeInfo::new(
                        Node::new(node_type, configured.index),
                        configured.retired,
                    ));
                }
            }
            while matches!(slots.last(), Some(None)) {
                slots.pop();
            }
        }

        if !removed.is_empty() {
            info!(
                cluster = %self.cluster_name,
                removed = removed.len(),
                "Nodes removed from configuration"
            );
        }
        self.configured = wanted;
        self.distribution = distribution;
        removed
    }

    fn slots(&self, node_type: NodeType) -> &Vec<Option<NodeInfo>> {
        match node_type {
            NodeType::Distributor => &self.distributors,
            NodeType::Storage => &self.storage,
        }
    }

    fn slots_mut(&mut self, node_type: NodeType) -> &mut Vec<Option<NodeInfo>> {
        match node_type {
            NodeType::Distributor => &mut self.distributors,
            NodeType::Storage => &mut self.storage,
        }
    }

    pub fn get(&self, node: Node) -> Option<&NodeInfo> {
        self.slots(node.node_type())
            .get(usize::from(node.index()))
            .and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, node: Node) -> Option<&mut NodeInfo> {
        self.slots_mut(node.node_type())
            .get_mut(usize::from(node.index()))
            .and_then(Option::as_mut)
    }

    pub fn contains(&self, node: Node) -> bool {
        self.get(node).is_some()
    }

    /// Every record, distributors first, each type in index order.
    pub fn node_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.distributors
            .iter()
            .chain(self.storage.iter())
            .filter_map(Option::as_ref)
    }

    pub fn node_infos_mut(&mut self) -> impl Iterator<Item = &mut NodeInfo> {
        self.distributors
            .iter_mut()
            .chain(self.storage.iter_mut())
            .filter_map(Option::as_mut)
    }

    pub fn node_infos_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &NodeInfo> {
        self.slots(node_type).iter().filter_map(Option::as_ref)
    }

    pub fn distributors(&self) -> impl Iterator<Item = &NodeInfo> {
        self.node_infos_of_type(NodeType::Distributor)
    }

    pub fn storage_nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.node_infos_of_type(NodeType::Storage)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.node_infos().map(NodeInfo::node).collect()
    }

    pub fn indices(&self, node_type: NodeType) -> BTreeSet<u16> {
        self.node_infos_of_type(node_type).map(NodeInfo::index).collect()
    }

    pub fn node_count(&self, node_type: NodeType) -> usize {
        self.node_infos_of_type(node_type).count()
    }

    /// Whether every configured node has reported a state.
    pub fn all_states_reported(&self) -> bool {
        self.node_infos().all(NodeInfo::has_reported_state)
    }

    /// Forget every reported state; used when stepping down as a state
    /// gatherer.
    pub fn clear_reported_states(&mut self) {
        for info in self.node_infos_mut() {
            info.clear_reported_state();
        }
    }

    /// Operator-set wanted states that differ from Up.
    pub fn wanted_states(&self) -> BTreeMap<Node, NodeState> {
        self.node_infos()
            .filter(|info| info.user_wanted_state().state() != State::Up)
            .map(|info| (info.node(), info.user_wanted_state().clone()))
            .collect()
    }

    /// Replace every wanted state; nodes absent from `states` become Up.
    pub fn apply_wanted_states(&mut self, states: &BTreeMap<Node, NodeState>) {
        for info in self.node_infos_mut() {
            let wanted = states
                .get(&info.node())
                .cloned()
                .unwrap_or_else(|| NodeState::new(info.node_type(), State::Up));
            info.set_wanted_state(wanted);
        }
    }

    /// Start timestamps every distributor has observed.
    pub fn start_timestamps(&self) -> BTreeMap<Node, u64> {
        self.node_infos()
            .filter(|info| info.start_timestamp() != 0)
            .map(|info| (info.node(), info.start_timestamp()))
            .collect()
    }

    pub fn apply_start_timestamps(&mut self, timestamps: &BTreeMap<Node, u64>) {
        for info in self.node_infos_mut() {
            info.set_start_timestamp(timestamps.get(&info.node()).copied().unwrap_or(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(count: u16) -> NodeRegistry {
        let nodes: Vec<_> = (0..count).map(ConfiguredNode::new).collect();
        NodeRegistry::new("music", &nodes, Distribution::flat(0..count))
    }

    #[test]
    fn test_both_types_created_per_index() {
        let reg = registry(3);
        assert_eq!(reg.node_count(NodeType::Storage), 3);
        assert_eq!(reg.node_count(NodeType::Distributor), 3);
        assert!(reg.contains(Node::storage(2)));
        assert!(!reg.contains(Node::storage(3)));
        assert_eq!(reg.nodes().first(), Some(&Node::distributor(0)));
    }

    #[test]
    fn test_sparse_indices() {
        let nodes = [ConfiguredNode::new(1), ConfiguredNode::retired(4)];
        let reg = NodeRegistry::new("music", &nodes, Distribution::flat([1, 4]));
        assert!(reg.get(Node::storage(0)).is_none());
        assert!(reg.get(Node::storage(4)).unwrap().is_configured_retired());
        assert_eq!(reg.indices(NodeType::Storage), BTreeSet::from([1, 4]));
    }

    #[test]
    fn test_set_nodes_keeps_surviving_records() {
        let mut reg = registry(3);
        reg.get_mut(Node::storage(1)).unwrap().set_premature_crash_count(2);

        let removed = reg.set_nodes(
            &[ConfiguredNode::new(0), ConfiguredNode::retired(1)],
            Distribution::flat(0..2),
        );
        assert_eq!(removed, vec![Node::distributor(2), Node::storage(2)]);
        let survivor = reg.get(Node::storage(1)).unwrap();
        assert_eq!(survivor.premature_crash_count(), 2);
        assert!(survivor.is_configured_retired());
        assert_eq!(reg.node_count(NodeType::Storage), 2);
    }

    #[test]
    fn test_wanted_states_round_trip() {
        let mut reg = registry(2);
        let maintenance = NodeState::new(NodeType::Storage, State::Maintenance);
        reg.get_mut(Node::storage(1))
            .unwrap()
            .set_wanted_state(maintenance.clone());
        let wanted = reg.wanted_states();
        assert_eq!(wanted.len(), 1);

        let mut other = registry(2);
        other.apply_wanted_states(&wanted);
        assert_eq!(
            other.get(Node::storage(1)).unwrap().user_wanted_state(),
            &maintenance
        );
    }

    #[test]
    fn test_all_states_reported() {
        let mut reg = registry(1);
        assert!(!reg.all_states_reported());
        for info in reg.node_infos_mut() {
            let up = NodeState::new(info.node_type(), State::Up);
            info.set_reported_state(up, 10);
        }
        assert!(reg.all_states_reported());
        reg.clear_reported_states();
        assert!(!reg.all_states_reported());
    }
}
