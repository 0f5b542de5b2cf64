//! Cluster state generation.
//!
//! [`generate`] maps the node registry and a set of parameters onto an
//! [`AnnotatedClusterState`]. It has no side effects and never fails: two
//! calls with the same inputs produce identical output.
//!
//! Per node the reported state is the starting point. It is then
//! - forced Down when the node crashed prematurely too often,
//! - stripped of a start timestamp every distributor has already seen,
//! - for storage nodes, forced Down while initializing too slowly or while
//!   still listing buckets, and held in Maintenance during the transition
//!   grace period,
//! - capped by the node's wanted state.
//!
//! Cluster-wide passes follow: group availability, the cluster down reason
//! and the distribution bit count.

mod group_availability;
mod resource_exhaustion;

pub use group_availability::GroupAvailabilityCalculator;
pub use resource_exhaustion::ResourceExhaustionCalculator;

use crate::clock::millis;
use crate::cluster::{NodeInfo, NodeRegistry};
use crate::config::ControllerConfig;
use crate::state::{
    AnnotatedClusterState, ClusterState, ClusterStateReason, Node, NodeState, NodeStateReason,
    NodeType, State, LISTING_BUCKETS_INIT_PROGRESS_LIMIT,
};
use std::collections::BTreeMap;

const GROUP_TAKEDOWN_DESCRIPTION: &str = "Group node availability below configured threshold";

/// Inputs to [`generate`] besides the registry.
#[derive(Debug, Clone)]
pub struct GeneratorParams<'a> {
    pub registry: &'a NodeRegistry,
    pub current_time: u64,
    pub storage_transition_time: u64,
    pub distributor_transition_time: u64,
    /// Zero means no node is ever too unstable.
    pub max_premature_crashes: u32,
    pub max_init_progress_time: u64,
    pub min_storage_nodes_up: usize,
    pub min_distributor_nodes_up: usize,
    pub min_storage_up_ratio: f64,
    pub min_distributor_up_ratio: f64,
    pub min_node_ratio_per_group: f64,
    pub ideal_distribution_bits: u32,
    pub lowest_observed_distribution_bits: u32,
}

impl<'a> GeneratorParams<'a> {
    /// Parameters with no policy thresholds and no timers.
    pub fn new(registry: &'a NodeRegistry) -> Self {
        Self {
            registry,
            current_time: 0,
            storage_transition_time: 0,
            distributor_transition_time: 0,
            max_premature_crashes: 0,
            max_init_progress_time: 0,
            min_storage_nodes_up: 0,
            min_distributor_nodes_up: 0,
            min_storage_up_ratio: 0.0,
            min_distributor_up_ratio: 0.0,
            min_node_ratio_per_group: 0.0,
            ideal_distribution_bits: crate::state::DEFAULT_DISTRIBUTION_BITS,
            lowest_observed_distribution_bits: crate::state::DEFAULT_DISTRIBUTION_BITS,
        }
    }

    pub fn from_config(config: &ControllerConfig, registry: &'a NodeRegistry) -> Self {
        let timing = &config.timing;
        let policy = &config.policy;
        Self {
            registry,
            current_time: 0,
            storage_transition_time: millis(timing.storage_transition_time),
            distributor_transition_time: millis(timing.distributor_transition_time),
            max_premature_crashes: policy.max_premature_crashes,
            max_init_progress_time: millis(timing.max_init_progress_time),
            min_storage_nodes_up: policy.min_storage_nodes_up,
            min_distributor_nodes_up: policy.min_distributor_nodes_up,
            min_storage_up_ratio: policy.min_storage_up_ratio,
            min_distributor_up_ratio: policy.min_distributor_up_ratio,
            min_node_ratio_per_group: policy.min_node_ratio_per_group,
            ideal_distribution_bits: policy.ideal_distribution_bits,
            lowest_observed_distribution_bits: policy.ideal_distribution_bits,
        }
    }

    pub fn current_time(mut self, now: u64) -> Self {
        self.current_time = now;
        self
    }

    pub fn transition_time(mut self, node_type: NodeType, time: u64) -> Self {
        match node_type {
            NodeType::Storage => self.storage_transition_time = time,
            NodeType::Distributor => self.distributor_transition_time = time,
        }
        self
    }

    pub fn max_premature_crashes(mut self, max: u32) -> Self {
        self.max_premature_crashes = max;
        self
    }

    pub fn max_init_progress_time(mut self, time: u64) -> Self {
        self.max_init_progress_time = time;
        self
    }

    pub fn min_storage_nodes_up(mut self, count: usize) -> Self {
        self.min_storage_nodes_up = count;
        self
    }

    pub fn min_distributor_nodes_up(mut self, count: usize) -> Self {
        self.min_distributor_nodes_up = count;
        self
    }

    pub fn min_storage_up_ratio(mut self, ratio: f64) -> Self {
        self.min_storage_up_ratio = ratio;
        self
    }

    pub fn min_distributor_up_ratio(mut self, ratio: f64) -> Self {
        self.min_distributor_up_ratio = ratio;
        self
    }

    pub fn min_node_ratio_per_group(mut self, ratio: f64) -> Self {
        self.min_node_ratio_per_group = ratio;
        self
    }

    pub fn ideal_distribution_bits(mut self, bits: u32) -> Self {
        self.ideal_distribution_bits = bits;
        self
    }

    pub fn lowest_observed_distribution_bits(mut self, bits: u32) -> Self {
        self.lowest_observed_distribution_bits = bits;
        self
    }

    fn transition_time_for(&self, node_type: NodeType) -> u64 {
        match node_type {
            NodeType::Storage => self.storage_transition_time,
            NodeType::Distributor => self.distributor_transition_time,
        }
    }
}

/// Generate an unversioned cluster state from the registry.
pub fn generate(params: &GeneratorParams<'_>) -> AnnotatedClusterState {
    let mut state = ClusterState::empty();
    state.set_cluster_state(State::Up);
    let mut node_reasons = BTreeMap::new();

    for info in params.registry.node_infos() {
        let (node_state, reason) = compute_effective_node_state(info, params);
        state.set_node_state(info.node(), node_state);
        if let Some(reason) = reason {
            node_reasons.insert(info.node(), reason);
        }
    }

    take_down_groups_with_too_low_availability(&mut state, &mut node_reasons, params);

    let reason = cluster_down_reason(&state, params);
    if reason.is_some() {
        state.set_cluster_state(State::Down);
    }
    state.set_distribution_bits(infer_distribution_bit_count(&state, params));

    AnnotatedClusterState::new(state, reason, node_reasons)
}

fn compute_effective_node_state(
    info: &NodeInfo,
    params: &GeneratorParams<'_>,
) -> (NodeState, Option<NodeStateReason>) {
    let reported = info.reported_state();
    let wanted = info.wanted_state();
    let mut baseline = reported.clone();
    let mut reason = None;

    if node_is_considered_too_unstable(info, params) {
        baseline.set_state(State::Down);
        baseline.set_description(format!(
            "Node is too unstable ({} premature crashes)",
            info.premature_crash_count()
        ));
        reason = Some(NodeStateReason::NodeTooUnstable);
    }
    if start_timestamp_is_obsolete(reported, info) {
        baseline.set_start_timestamp(0);
    }
    if info.is_storage() {
        apply_storage_specific_transforms(info, &wanted, &mut baseline, &mut reason, params);
    }
    if baseline.above(&wanted) {
        baseline.set_state(wanted.state());
        baseline.set_description(wanted.description());
    }

    (baseline, reason)
}

fn node_is_considered_too_unstable(info: &NodeInfo, params: &GeneratorParams<'_>) -> bool {
    params.max_premature_crashes != 0 && info.premature_crash_count() > params.max_premature_crashes
}

fn start_timestamp_is_obsolete(reported: &NodeState, info: &NodeInfo) -> bool {
    reported.start_timestamp() != 0 && reported.start_timestamp() == info.start_timestamp()
}

fn apply_storage_specific_transforms(
    info: &NodeInfo,
    wanted: &NodeState,
    baseline: &mut NodeState,
    reason: &mut Option<NodeStateReason>,
    params: &GeneratorParams<'_>,
) {
    if baseline.state() == State::Initializing {
        if init_progress_has_timed_out(info, params) {
            baseline.set_state(State::Down);
            baseline.set_description("Initialization progress timed out");
        } else if is_listing_buckets(baseline) {
            baseline.set_state(State::Down);
            baseline.set_description(format!(
                "Listing buckets. Progress {:.1} %. Considered down",
                baseline.init_progress() * 100.0
            ));
        } else if info.recently_unstable_during_init() {
            baseline.set_state(State::Down);
            baseline.set_description("Node was recently unstable during initialization");
        }
    }

    if baseline.state() == State::Initializing && wanted.state() == State::Retired {
        baseline.set_state(State::Maintenance);
    }

    if within_temporal_maintenance_period(info, baseline, reason, params)
        && wanted.state() != State::Down
    {
        baseline.set_state(State::Maintenance);
    }
}

fn init_progress_has_timed_out(info: &NodeInfo, params: &GeneratorParams<'_>) -> bool {
    params.max_init_progress_time != 0
        && info.init_progress_time() + params.max_init_progress_time <= params.current_time
}

fn is_listing_buckets(state: &NodeState) -> bool {
    state.init_progress() <= LISTING_BUCKETS_INIT_PROGRESS_LIMIT + 0.00001
}

/// Whether a Down or Stopping node is still within the grace period after
/// its last transition. Once the period has passed the node is tagged as
/// not having come back in time.
fn within_temporal_maintenance_period(
    info: &NodeInfo,
    baseline: &NodeState,
    reason: &mut Option<NodeStateReason>,
    params: &GeneratorParams<'_>,
) -> bool {
    let grace = params.transition_time_for(info.node_type());
    if grace == 0 || !matches!(baseline.state(), State::Stopping | State::Down) {
        return false;
    }
    if info.transition_time() != 0 && info.transition_time() + grace > params.current_time {
        *reason = Some(NodeStateReason::WithinMaintenanceGracePeriod);
        return true;
    }
    *reason = Some(NodeStateReason::NodeNotBackUpWithinGracePeriod);
    false
}

fn take_down_groups_with_too_low_availability(
    state: &mut ClusterState,
    node_reasons: &mut BTreeMap<Node, NodeStateReason>,
    params: &GeneratorParams<'_>,
) {
    let calculator = GroupAvailabilityCalculator::new(
        params.registry.distribution(),
        params.min_node_ratio_per_group,
    );
    for index in calculator.nodes_that_should_be_taken_down(state) {
        let storage = Node::storage(index);
        let mut storage_state = state.node_state(storage);
        if is_group_takedown_candidate(&storage_state) {
            storage_state.set_state(State::Maintenance);
            storage_state.set_description(GROUP_TAKEDOWN_DESCRIPTION);
            state.set_node_state(storage, storage_state);
            node_reasons.insert(storage, NodeStateReason::GroupInMaintenance);
        }

        let distributor = Node::distributor(index);
        if !params.registry.contains(distributor) {
            continue;
        }
        let mut distributor_state = state.node_state(distributor);
        if is_group_takedown_candidate(&distributor_state) {
            distributor_state.set_state(State::Down);
            distributor_state.set_description(GROUP_TAKEDOWN_DESCRIPTION);
            state.set_node_state(distributor, distributor_state);
            node_reasons.insert(distributor, NodeStateReason::GroupIsDown);
        }
    }
}

fn is_group_takedown_candidate(state: &NodeState) -> bool {
    matches!(state.state(), State::Up | State::Initializing)
}

fn cluster_down_reason(
    state: &ClusterState,
    params: &GeneratorParams<'_>,
) -> Option<ClusterStateReason> {
    let available = |node_type: NodeType| {
        state
            .nodes_of_type(node_type)
            .filter(|(node, ns)| params.registry.contains(*node) && ns.state().is_available())
            .count()
    };
    let storage_up = available(NodeType::Storage);
    let distributors_up = available(NodeType::Distributor);
    let storage_total = params.registry.node_count(NodeType::Storage);
    let distributor_total = params.registry.node_count(NodeType::Distributor);

    let ratio = |up: usize, total: usize| {
        if total == 0 {
            1.0
        } else {
            up as f64 / total as f64
        }
    };

    if storage_up < params.min_storage_nodes_up {
        Some(ClusterStateReason::TooFewStorageNodesAvailable)
    } else if distributors_up < params.min_distributor_nodes_up {
        Some(ClusterStateReason::TooFewDistributorNodesAvailable)
    } else if ratio(storage_up, storage_total) < params.min_storage_up_ratio {
        Some(ClusterStateReason::TooLowAvailableStorageNodeRatio)
    } else if ratio(distributors_up, distributor_total) < params.min_distributor_up_ratio {
        Some(ClusterStateReason::TooLowAvailableDistributorNodeRatio)
    } else {
        None
    }
}

/// Distribution bits only ever tighten: the result never exceeds the ideal
/// count, the lowest count observed so far, or what any available storage
/// node reports using.
fn infer_distribution_bit_count(state: &ClusterState, params: &GeneratorParams<'_>) -> u32 {
    params
        .registry
        .storage_nodes()
        .filter(|info| state.node_state(info.node()).state().is_available())
        .map(|info| info.reported_state().min_used_bits())
        .fold(
            params
                .ideal_distribution_bits
                .min(params.lowest_observed_distribution_bits),
            u32::min,
        )
}
