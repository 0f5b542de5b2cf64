use crate::state::{AnnotatedClusterState, Node, NodeStateReason, State};
use crate::stats::{MergePendingChecker, DEFAULT_SPACE, GLOBAL_SPACE};
use std::collections::BTreeSet;

/// Turns the baseline state into the state for one bucket space. Picked
/// once per reconfiguration and applied to every configured space.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClusterStateDeriver {
    /// Every space gets the baseline.
    #[default]
    Identity,
    /// Storage nodes that may still have global-space merges pending are
    /// held in Maintenance in the default space.
    MaintenanceWhenPendingGlobalMerges { pending: BTreeSet<u16> },
}

impl ClusterStateDeriver {
    /// Build the global-merge deriver from the current merge-pending view.
    pub fn maintenance_when_pending_global_merges<I>(checker: &MergePendingChecker<'_>, storage: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        let pending = storage
            .into_iter()
            .filter(|&index| checker.may_have_merges_pending(GLOBAL_SPACE, index))
            .collect();
        ClusterStateDeriver::MaintenanceWhenPendingGlobalMerges { pending }
    }

    pub fn derive(&self, baseline: &AnnotatedClusterState, space: &str) -> AnnotatedClusterState {
        let pending = match self {
            ClusterStateDeriver::Identity => return baseline.clone(),
            ClusterStateDeriver::MaintenanceWhenPendingGlobalMerges { pending } => pending,
        };
        if space != DEFAULT_SPACE || pending.is_empty() {
            return baseline.clone();
        }

        let mut state = baseline.cluster_state().clone();
        let mut reasons = baseline.node_reasons().clone();
        for &index in pending {
            let node = Node::storage(index);
            let mut node_state = state.node_state(node);
            if node_state.state().is_available() {
                node_state.set_state(State::Maintenance);
                state.set_node_state(node, node_state);
                reasons.insert(node, NodeStateReason::MayHaveMergesPending);
            }
        }
        AnnotatedClusterState::new(state, baseline.reason(), reasons)
    }
}
