//! Cluster state broadcasting.
//!
//! A published bundle goes out in up to two phases:
//! 1. the bundle is sent to every reachable node that has not acknowledged
//!    it yet, once its version is durably stored;
//! 2. with deferred activation, an activation is sent once every required
//!    distributor acknowledged phase 1.
//!
//! A version has converged when every distributor that is available in the
//! bundle acknowledged it (and activated it, in two-phase mode).

use crate::cluster::{NodeInfo, NodeRegistry, LATEST_RPC_VERSION};
use crate::communicator::{ActivateReply, Communicator, RpcError};
use crate::events::{EventLog, EventType};
use crate::observability;
use crate::state::{ClusterState, ClusterStateBundle, Node, NodeType};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SystemStateBroadcaster {
    bundle: ClusterStateBundle,
    official_version: u32,
    last_converged_version: u32,
    set_cluster_state_timeout: u64,
    max_divergent_nodes_printed: usize,
}

impl SystemStateBroadcaster {
    pub fn new(set_cluster_state_timeout: u64, max_divergent_nodes_printed: usize) -> Self {
        Self {
            bundle: ClusterStateBundle::empty(),
            official_version: 0,
            last_converged_version: 0,
            set_cluster_state_timeout,
            max_divergent_nodes_printed,
        }
    }

    pub fn reconfigure(&mut self, set_cluster_state_timeout: u64, max_divergent_nodes_printed: usize) {
        self.set_cluster_state_timeout = set_cluster_state_timeout;
        self.max_divergent_nodes_printed = max_divergent_nodes_printed;
    }

    /// Forget the current bundle, as when a new master tenure starts.
    pub fn clear(&mut self) {
        self.bundle = ClusterStateBundle::empty();
        self.official_version = 0;
        self.last_converged_version = 0;
    }

    pub fn handle_new_cluster_states(&mut self, bundle: ClusterStateBundle) {
        self.bundle = bundle;
    }

    pub fn cluster_state_bundle(&self) -> &ClusterStateBundle {
        &self.bundle
    }

    pub fn last_converged_version(&self) -> u32 {
        self.last_converged_version
    }

    /// Whether the current bundle's version has been stored and may go out.
    pub fn is_official(&self) -> bool {
        self.bundle.version() != 0 && self.official_version == self.bundle.version()
    }

    /// Record the reply to a bundle push.
    pub fn handle_set_cluster_state_reply(
        &mut self,
        info: &mut NodeInfo,
        version: u32,
        result: Result<(), RpcError>,
        events: &mut EventLog,
        now: u64,
    ) {
        match result {
            Ok(()) => {
                if version > info.state_version_acked() {
                    debug!(node = %info.node(), version, "node acknowledged cluster state");
                }
                info.handle_state_version_ack(version);
            }
            Err(RpcError::NoSuchMethod) => {
                if info.downgrade_rpc_version() {
                    debug!(node = %info.node(), rpc_version = info.rpc_version(), "downgraded RPC version");
                } else {
                    warn!(node = %info.node(), version, "node supports no known cluster state RPC");
                }
                info.handle_state_version_failure(version);
            }
            Err(error) => {
                observability::record_rpc_failure("set_cluster_state");
                if !error.is_transient() {
                    events.add_node_event(
                        info.node(),
                        EventType::NodeCurrent,
                        format!("Failed to send cluster state version {}: {}", version, error),
                        now,
                    );
                }
                info.handle_state_version_failure(version);
            }
        }
    }

    /// Record the reply to an activation. Nodes that do not know the
    /// activation RPC are taken to have activated implicitly.
    pub fn handle_activate_reply(
        &mut self,
        info: &mut NodeInfo,
        version: u32,
        result: Result<ActivateReply, RpcError>,
        events: &mut EventLog,
        now: u64,
    ) {
        match result {
            Ok(reply) if reply.actual_version == version => info.handle_activation_ack(version),
            Ok(reply) => {
                warn!(
                    node = %info.node(),
                    version,
                    actual = reply.actual_version,
                    "node activated a different cluster state version"
                );
                events.add_node_event(
                    info.node(),
                    EventType::NodeCurrent,
                    format!(
                        "Activation of version {} reported version {} as active",
                        version, reply.actual_version
                    ),
                    now,
                );
                info.handle_activation_failure(version);
            }
            Err(RpcError::NoSuchMethod) => info.handle_activation_ack(version),
            Err(error) => {
                observability::record_rpc_failure("activate_cluster_state_version");
                debug!(node = %info.node(), version, error = %error, "activation failed");
                info.handle_activation_failure(version);
            }
        }
    }

    /// Send the current bundle to every node that needs it. Nothing goes
    /// out until the bundle's version equals `stored_version`, the last
    /// version durably written to the coordination store.
    pub fn broadcast_new_state_bundle_if_required(
        &mut self,
        registry: &mut NodeRegistry,
        communicator: &dyn Communicator,
        stored_version: u32,
        events: &mut EventLog,
        now: u64,
    ) -> bool {
        let version = self.bundle.version();
        if version == 0 {
            return false;
        }
        if !self.is_official() {
            if version != stored_version {
                return false;
            }
            self.official_version = version;
            info!(version, state = %self.bundle, "publishing cluster state");
            events.add_cluster_event(
                EventType::SystemState,
                format!("New cluster state version {}: {}", version, self.bundle),
                now,
            );
            observability::record_published_state(self.bundle.baseline_state());
        }

        self.expire_timed_out_sends(registry, version, now);

        let recipients: Vec<Node> = registry
            .node_infos()
            .filter(|info| node_needs_bundle(info, version))
            .map(NodeInfo::node)
            .collect();

        for &node in &recipients {
            let Some(info) = registry.get(node) else {
                continue;
            };
            if node_needs_to_observe_start_timestamps(info) {
                let patched = self
                    .bundle
                    .map_states(|state| with_known_start_timestamps(state, registry));
                communicator.set_cluster_state(info, &patched);
            } else {
                communicator.set_cluster_state(info, &self.bundle);
            }
            if let Some(info) = registry.get_mut(node) {
                info.mark_state_version_sent(version, now);
            }
        }
        !recipients.is_empty()
    }

    fn expire_timed_out_sends(&self, registry: &mut NodeRegistry, version: u32, now: u64) {
        for info in registry.node_infos_mut() {
            if let Some(sent_at) = info.state_version_sent_at(version) {
                if sent_at + self.set_cluster_state_timeout <= now {
                    debug!(node = %info.node(), version, "cluster state send timed out");
                    observability::record_rpc_failure("set_cluster_state");
                    info.handle_state_version_failure(version);
                }
            }
        }
    }

    /// Phase two: activate the current version on nodes that acknowledged
    /// it, once every required distributor has.
    pub fn broadcast_state_activations_if_required(
        &mut self,
        registry: &mut NodeRegistry,
        communicator: &dyn Communicator,
    ) -> bool {
        let version = self.bundle.version();
        if !self.bundle.deferred_activation() || !self.is_official() {
            return false;
        }
        if !self.all_required_distributors(registry, |info| info.state_version_acked() >= version) {
            return false;
        }

        let mut sent = false;
        for info in registry.node_infos_mut() {
            if info.state_version_acked() < version
                || info.activation_version_sent() >= version
                || info.activation_version_acked() >= version
            {
                continue;
            }
            if info.rpc_version() < LATEST_RPC_VERSION {
                // Old dialects activate on receipt.
                info.handle_activation_ack(version);
                continue;
            }
            communicator.activate_cluster_state_version(info, version);
            info.mark_activation_sent(version);
            sent = true;
        }
        sent
    }

    /// Returns the current version the first time every required
    /// distributor has acknowledged (and, when deferred, activated) it.
    pub fn check_if_cluster_state_is_acked_by_all_distributors(
        &mut self,
        registry: &NodeRegistry,
    ) -> Option<u32> {
        let version = self.bundle.version();
        if !self.is_official() || self.last_converged_version == version {
            return None;
        }
        let deferred = self.bundle.deferred_activation();
        let converged = self.all_required_distributors(registry, |info| {
            info.state_version_acked() >= version
                && (!deferred || info.activation_version_acked() >= version)
        });
        if !converged {
            return None;
        }
        info!(version, "all distributors acknowledged cluster state");
        self.last_converged_version = version;
        Some(version)
    }

    fn all_required_distributors(
        &self,
        registry: &NodeRegistry,
        done: impl Fn(&NodeInfo) -> bool,
    ) -> bool {
        let baseline = self.bundle.baseline_state();
        registry
            .distributors()
            .filter(|info| baseline.node_state(info.node()).state().is_available())
            .all(done)
    }

    /// Nodes that have not yet converged on the current version, listing at
    /// most the configured number of them.
    pub fn divergent_nodes_description(&self, registry: &NodeRegistry) -> String {
        let version = self.bundle.version();
        let deferred = self.bundle.deferred_activation();
        let baseline = self.bundle.baseline_state();
        let divergent: Vec<String> = registry
            .node_infos()
            .filter(|info| baseline.node_state(info.node()).state().is_available())
            .filter(|info| {
                info.state_version_acked() < version
                    || (deferred && info.activation_version_acked() < version)
            })
            .map(|info| info.node().to_string())
            .collect();

        if divergent.is_empty() {
            return format!("all nodes have converged to version {}", version);
        }
        let mut description = divergent
            .iter()
            .take(self.max_divergent_nodes_printed)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        if divergent.len() > self.max_divergent_nodes_printed {
            description.push_str(&format!(
                " (and {} more)",
                divergent.len() - self.max_divergent_nodes_printed
            ));
        }
        format!(
            "{} node(s) have not converged to version {}: {}",
            divergent.len(),
            version,
            description
        )
    }
}

fn node_needs_bundle(info: &NodeInfo, version: u32) -> bool {
    info.is_reachable()
        && info.state_version_acked() < version
        && info.state_version_sent_at(version).is_none()
}

/// A node that went down with the start timestamp every distributor had
/// already seen has lost that knowledge and gets it back in its copy.
fn node_needs_to_observe_start_timestamps(info: &NodeInfo) -> bool {
    info.start_timestamp() != 0 && info.went_down_with_start_time() == info.start_timestamp()
}

fn with_known_start_timestamps(state: &ClusterState, registry: &NodeRegistry) -> ClusterState {
    let mut patched = state.clone();
    for info in registry.node_infos_of_type(NodeType::Storage) {
        let mut ns = patched.node_state(info.node());
        if ns.start_timestamp() == 0 && info.start_timestamp() != 0 {
            ns.set_start_timestamp(info.start_timestamp());
            patched.set_node_state(info.node(), ns);
        }
    }
    patched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConfiguredNode, Distribution};
    use crate::state::{AnnotatedClusterState, NodeState, State};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        bundles: Mutex<Vec<(Node, ClusterStateBundle)>>,
        activations: Mutex<Vec<(Node, u32)>>,
    }

    impl Communicator for Recorder {
        fn get_node_state(&self, _node: &NodeInfo, _request_id: u64) {}

        fn set_cluster_state(&self, node: &NodeInfo, bundle: &ClusterStateBundle) {
            self.bundles.lock().push((node.node(), bundle.clone()));
        }

        fn activate_cluster_state_version(&self, node: &NodeInfo, version: u32) {
            self.activations.lock().push((node.node(), version));
        }
    }

    fn registry() -> NodeRegistry {
        let nodes: Vec<_> = (0..2).map(ConfiguredNode::new).collect();
        let mut reg = NodeRegistry::new("music", &nodes, Distribution::flat(0..2));
        for node in reg.nodes() {
            let info = reg.get_mut(node).unwrap();
            info.set_rpc_address(format!("tcp/{}", node));
            info.set_reported_state(NodeState::new(node.node_type(), State::Up), 0);
        }
        reg
    }

    fn bundle(version: u32, deferred: bool) -> ClusterStateBundle {
        let state: ClusterState = format!("version:{} distributor:2 storage:2", version)
            .parse()
            .unwrap();
        ClusterStateBundle::builder(AnnotatedClusterState::with_state(state))
            .deferred_activation(deferred)
            .derive_and_build()
    }

    fn ack_all(broadcaster: &mut SystemStateBroadcaster, reg: &mut NodeRegistry, version: u32) {
        let mut events = EventLog::default();
        for info in reg.node_infos_mut() {
            broadcaster.handle_set_cluster_state_reply(info, version, Ok(()), &mut events, 0);
        }
    }

    #[test]
    fn test_nothing_sent_before_version_is_stored() {
        let mut reg = registry();
        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        broadcaster.handle_new_cluster_states(bundle(3, false));

        assert!(!broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 2, &mut events, 0));
        assert!(comm.bundles.lock().is_empty());

        assert!(broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 3, &mut events, 0));
        assert_eq!(comm.bundles.lock().len(), 4);
        assert!(broadcaster.is_official());

        // Already sent and not timed out.
        assert!(!broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 3, &mut events, 1));
    }

    #[test]
    fn test_unreachable_nodes_are_skipped() {
        let mut reg = registry();
        reg.get_mut(Node::storage(1))
            .unwrap()
            .set_reported_state(NodeState::new(NodeType::Storage, State::Down), 0);
        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        broadcaster.handle_new_cluster_states(bundle(1, false));
        broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 1, &mut events, 0);
        assert!(comm
            .bundles
            .lock()
            .iter()
            .all(|(node, _)| *node != Node::storage(1)));
    }

    #[test]
    fn test_failed_send_is_retried() {
        let mut reg = registry();
        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        broadcaster.handle_new_cluster_states(bundle(1, false));
        broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 1, &mut events, 0);

        let info = reg.get_mut(Node::storage(0)).unwrap();
        broadcaster.handle_set_cluster_state_reply(
            info,
            1,
            Err(RpcError::Connection("reset".into())),
            &mut events,
            1,
        );
        assert!(broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 1, &mut events, 2));
        assert_eq!(comm.bundles.lock().last().unwrap().0, Node::storage(0));
    }

    #[test]
    fn test_timed_out_send_is_retried() {
        let mut reg = registry();
        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(1_000, 10);
        broadcaster.handle_new_cluster_states(bundle(1, false));
        broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 1, &mut events, 0);
        assert!(broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 1, &mut events, 1_000));
        assert_eq!(comm.bundles.lock().len(), 8);
    }

    #[test]
    fn test_convergence_requires_all_available_distributors() {
        let mut reg = registry();
        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        broadcaster.handle_new_cluster_states(bundle(1, false));
        broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 1, &mut events, 0);

        let info = reg.get_mut(Node::distributor(0)).unwrap();
        broadcaster.handle_set_cluster_state_reply(info, 1, Ok(()), &mut events, 1);
        assert_eq!(broadcaster.check_if_cluster_state_is_acked_by_all_distributors(&reg), None);
        assert!(broadcaster
            .divergent_nodes_description(&reg)
            .contains("distributor.1"));

        let info = reg.get_mut(Node::distributor(1)).unwrap();
        broadcaster.handle_set_cluster_state_reply(info, 1, Ok(()), &mut events, 1);
        assert_eq!(broadcaster.check_if_cluster_state_is_acked_by_all_distributors(&reg), Some(1));
        assert_eq!(broadcaster.check_if_cluster_state_is_acked_by_all_distributors(&reg), None);
        assert_eq!(broadcaster.last_converged_version(), 1);
    }

    #[test]
    fn test_stale_ack_does_not_regress() {
        let mut reg = registry();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        let info = reg.get_mut(Node::storage(0)).unwrap();
        broadcaster.handle_set_cluster_state_reply(info, 5, Ok(()), &mut events, 0);
        broadcaster.handle_set_cluster_state_reply(info, 4, Ok(()), &mut events, 0);
        assert_eq!(info.state_version_acked(), 5);
    }

    #[test]
    fn test_two_phase_activation() {
        let mut reg = registry();
        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        broadcaster.handle_new_cluster_states(bundle(2, true));
        broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 2, &mut events, 0);
        assert!(!broadcaster.broadcast_state_activations_if_required(&mut reg, &comm));

        ack_all(&mut broadcaster, &mut reg, 2);
        assert_eq!(broadcaster.check_if_cluster_state_is_acked_by_all_distributors(&reg), None);
        assert!(broadcaster.broadcast_state_activations_if_required(&mut reg, &comm));
        assert_eq!(comm.activations.lock().len(), 4);
        assert!(!broadcaster.broadcast_state_activations_if_required(&mut reg, &comm));

        for node in [Node::distributor(0), Node::distributor(1)] {
            let info = reg.get_mut(node).unwrap();
            broadcaster.handle_activate_reply(
                info,
                2,
                Ok(ActivateReply { actual_version: 2 }),
                &mut events,
                1,
            );
        }
        assert_eq!(broadcaster.check_if_cluster_state_is_acked_by_all_distributors(&reg), Some(2));
    }

    #[test]
    fn test_activation_unknown_method_counts_as_activated() {
        let mut reg = registry();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        let info = reg.get_mut(Node::distributor(0)).unwrap();
        broadcaster.handle_activate_reply(info, 3, Err(RpcError::NoSuchMethod), &mut events, 0);
        assert_eq!(info.activation_version_acked(), 3);
    }

    #[test]
    fn test_activation_of_other_version_is_not_an_ack() {
        let mut reg = registry();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        let info = reg.get_mut(Node::distributor(0)).unwrap();
        broadcaster.handle_activate_reply(
            info,
            3,
            Ok(ActivateReply { actual_version: 2 }),
            &mut events,
            0,
        );
        assert_eq!(info.activation_version_acked(), 0);
        let event = events.node_events(Node::distributor(0)).last().unwrap();
        assert!(event.description.contains("reported version 2"), "{}", event.description);
    }

    #[test]
    fn test_restarted_node_gets_patched_bundle() {
        let mut reg = registry();
        let info = reg.get_mut(Node::storage(1)).unwrap();
        info.set_reported_state(
            NodeState::new(NodeType::Storage, State::Up).with_start_timestamp(99),
            0,
        );
        info.set_start_timestamp(99);
        info.set_reported_state(NodeState::new(NodeType::Storage, State::Down), 1);
        info.set_reported_state(NodeState::new(NodeType::Storage, State::Up), 2);

        let comm = Recorder::default();
        let mut events = EventLog::default();
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 10);
        broadcaster.handle_new_cluster_states(bundle(4, false));
        broadcaster.broadcast_new_state_bundle_if_required(&mut reg, &comm, 4, &mut events, 3);

        let bundles = comm.bundles.lock();
        let (_, patched) = bundles
            .iter()
            .find(|(node, _)| *node == Node::storage(1))
            .unwrap();
        assert_eq!(
            patched.baseline_state().node_state(Node::storage(1)).start_timestamp(),
            99
        );
        let (_, plain) = bundles
            .iter()
            .find(|(node, _)| *node == Node::storage(0))
            .unwrap();
        assert_eq!(plain.baseline_state().node_state(Node::storage(1)).start_timestamp(), 0);
    }

    #[test]
    fn test_divergent_description_is_bounded() {
        let nodes: Vec<_> = (0..5).map(ConfiguredNode::new).collect();
        let reg = NodeRegistry::new("music", &nodes, Distribution::flat(0..5));
        let mut broadcaster = SystemStateBroadcaster::new(30_000, 2);
        let state: ClusterState = "version:1 distributor:5 storage:5".parse().unwrap();
        broadcaster.handle_new_cluster_states(ClusterStateBundle::of_baseline_only(
            AnnotatedClusterState::with_state(state),
        ));
        assert_eq!(
            broadcaster.divergent_nodes_description(&reg),
            "10 node(s) have not converged to version 1: distributor.0, distributor.1 (and 8 more)"
        );
    }
}
