//! Cluster states annotated with the reasons behind them.

use super::cluster_state::ClusterState;
use super::node::Node;
use std::collections::BTreeMap;
use std::fmt;

/// Why the whole cluster was marked down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterStateReason {
    TooFewStorageNodesAvailable,
    TooFewDistributorNodesAvailable,
    TooLowAvailableStorageNodeRatio,
    TooLowAvailableDistributorNodeRatio,
}

impl fmt::Display for ClusterStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClusterStateReason::TooFewStorageNodesAvailable => "too few storage nodes available",
            ClusterStateReason::TooFewDistributorNodesAvailable => {
                "too few distributor nodes available"
            }
            ClusterStateReason::TooLowAvailableStorageNodeRatio => {
                "too low ratio of available storage nodes"
            }
            ClusterStateReason::TooLowAvailableDistributorNodeRatio => {
                "too low ratio of available distributor nodes"
            }
        };
        f.write_str(text)
    }
}

/// Why a single node got a state other than its reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStateReason {
    NodeTooUnstable,
    WithinMaintenanceGracePeriod,
    NodeNotBackUpWithinGracePeriod,
    GroupIsDown,
    GroupInMaintenance,
    MayHaveMergesPending,
}

/// An immutable cluster state plus its cluster-level and per-node reasons.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedClusterState {
    cluster_state: ClusterState,
    reason: Option<ClusterStateReason>,
    node_reasons: BTreeMap<Node, NodeStateReason>,
}

impl AnnotatedClusterState {
    pub fn new(
        cluster_state: ClusterState,
        reason: Option<ClusterStateReason>,
        node_reasons: BTreeMap<Node, NodeStateReason>,
    ) -> Self {
        Self {
            cluster_state,
            reason,
            node_reasons,
        }
    }

    pub fn with_state(cluster_state: ClusterState) -> Self {
        Self::new(cluster_state, None, BTreeMap::new())
    }

    pub fn empty() -> Self {
        Self::with_state(ClusterState::empty())
    }

    pub fn cluster_state(&self) -> &ClusterState {
        &self.cluster_state
    }

    pub fn reason(&self) -> Option<ClusterStateReason> {
        self.reason
    }

    pub fn node_reasons(&self) -> &BTreeMap<Node, NodeStateReason> {
        &self.node_reasons
    }

    pub fn node_reason(&self, node: Node) -> Option<NodeStateReason> {
        self.node_reasons.get(&node).copied()
    }

    pub fn version(&self) -> u32 {
        self.cluster_state.version()
    }

    pub fn cloned_with_version(&self, version: u32) -> Self {
        Self {
            cluster_state: self.cluster_state.cloned_with_version(version),
            reason: self.reason,
            node_reasons: self.node_reasons.clone(),
        }
    }

    /// Copy with the cluster state replaced by `f(state)`.
    pub fn map_state(&self, f: impl FnOnce(&ClusterState) -> ClusterState) -> Self {
        Self {
            cluster_state: f(&self.cluster_state),
            reason: self.reason,
            node_reasons: self.node_reasons.clone(),
        }
    }

    pub fn similar_to_ignoring_init_progress(&self, other: &AnnotatedClusterState) -> bool {
        self.cluster_state
            .similar_to_ignoring_init_progress(&other.cluster_state)
    }
}

impl fmt::Display for AnnotatedClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cluster_state)?;
        if let Some(reason) = self.reason {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}
