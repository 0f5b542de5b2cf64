//! Configurations and node states used across tests.

use content_controller::config::ControllerConfig;
use content_controller::{Node, NodeState, State};
use std::time::Duration;

/// Start time of every simulated cluster.
pub const START_MILLIS: u64 = 1_000_000;

/// A flat cluster of `node_count` distributors and storage nodes, controlled
/// by replica `index` of `replicas`.
pub fn replica_config(node_count: u16, index: u32, replicas: u32) -> ControllerConfig {
    let mut config = ControllerConfig::development(node_count);
    config.cluster_name = "music".to_string();
    config.controller.index = index;
    config.controller.count = replicas;
    config.controller.state_gather_count = replicas;
    config.controller.master_cooldown_period = Duration::from_secs(5);
    config.publishing.bucket_spaces = Vec::new();
    config
}

pub fn up(node: Node) -> NodeState {
    NodeState::new(node.node_type(), State::Up)
}

pub fn down(node: Node) -> NodeState {
    NodeState::new(node.node_type(), State::Down)
}

pub fn maintenance(node: Node) -> NodeState {
    NodeState::new(node.node_type(), State::Maintenance)
}

pub fn initializing(node: Node, progress: f64) -> NodeState {
    NodeState::new(node.node_type(), State::Initializing).with_init_progress(progress)
}

/// Every node of a flat cluster.
pub fn all_nodes(node_count: u16) -> Vec<Node> {
    (0..node_count)
        .flat_map(|i| [Node::distributor(i), Node::storage(i)])
        .collect()
}
