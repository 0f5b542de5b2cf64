//! Per-node bookkeeping owned by the node registry.
//!
//! One [`NodeInfo`] exists per configured node, tagged with its
//! [`NodeType`]. Storage-only fields (configured retirement, init timers)
//! are simply unused for distributors.

use super::host_info::HostInfo;
use crate::state::{Node, NodeState, NodeType, State};
use std::collections::BTreeMap;

/// Newest RPC dialect; supports two-phase activation.
pub const LATEST_RPC_VERSION: u8 = 3;
/// Oldest RPC dialect a node can be downgraded to.
pub const OLDEST_RPC_VERSION: u8 = 1;

/// An outstanding `getNodeState` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStateRequest {
    pub id: u64,
    pub sent_at: u64,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: Node,
    configured_retired: bool,

    // Liveness registry
    rpc_address: Option<String>,
    rpc_address_outdated: bool,
    last_seen_in_lookup: u64,

    // Reported and wanted state
    reported_state: NodeState,
    state_reported: bool,
    wanted_state: NodeState,
    host_info: HostInfo,

    // Stability timers
    premature_crash_count: u32,
    transition_time: u64,
    init_progress_time: u64,
    up_stable_state_time: u64,
    down_stable_state_time: u64,
    recently_unstable_during_init: bool,
    start_timestamp: u64,
    went_down_with_start_time: u64,

    // Node state polling
    pending_request: Option<NodeStateRequest>,
    failed_attempts: u32,
    next_attempt_time: u64,
    rpc_version: u8,

    // Cluster state broadcast
    pending_state_versions: BTreeMap<u32, u64>,
    state_version_acked: u32,
    activation_version_sent: u32,
    activation_version_acked: u32,
}

impl NodeInfo {
    pub fn new(node: Node, configured_retired: bool) -> Self {
        Self {
            node,
            configured_retired: configured_retired && node.node_type() == NodeType::Storage,
            rpc_address: None,
            rpc_address_outdated: false,
            last_seen_in_lookup: 0,
            reported_state: Self::initial_reported_state(node),
            state_reported: false,
            wanted_state: NodeState::new(node.node_type(), State::Up),
            host_info: HostInfo::default(),
            premature_crash_count: 0,
            transition_time: 0,
            init_progress_time: 0,
            up_stable_state_time: 0,
            down_stable_state_time: 0,
            recently_unstable_during_init: false,
            start_timestamp: 0,
            went_down_with_start_time: 0,
            pending_request: None,
            failed_attempts: 0,
            next_attempt_time: 0,
            rpc_version: LATEST_RPC_VERSION,
            pending_state_versions: BTreeMap::new(),
            state_version_acked: 0,
            activation_version_sent: 0,
            activation_version_acked: 0,
        }
    }

    fn initial_reported_state(node: Node) -> NodeState {
        NodeState::new(node.node_type(), State::Down).with_description("Node state not yet reported")
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn node_type(&self) -> NodeType {
        self.node.node_type()
    }

    pub fn index(&self) -> u16 {
        self.node.index()
    }

    pub fn is_storage(&self) -> bool {
        self.node.node_type() == NodeType::Storage
    }

    pub fn is_distributor(&self) -> bool {
        self.node.node_type() == NodeType::Distributor
    }

    pub fn is_configured_retired(&self) -> bool {
        self.configured_retired
    }

    pub(crate) fn set_configured_retired(&mut self, retired: bool) {
        self.configured_retired = retired && self.is_storage();
    }

    // Liveness registry

    pub fn rpc_address(&self) -> Option<&str> {
        self.rpc_address.as_deref()
    }

    pub fn set_rpc_address(&mut self, address: impl Into<String>) {
        self.rpc_address = Some(address.into());
        self.rpc_address_outdated = false;
    }

    /// The node disappeared from the liveness registry at `now`.
    pub fn mark_rpc_address_outdated(&mut self, now: u64) {
        self.rpc_address_outdated = true;
        self.last_seen_in_lookup = now;
    }

    pub fn mark_rpc_address_live(&mut self) {
        self.rpc_address_outdated = false;
    }

    pub fn is_not_in_lookup(&self) -> bool {
        self.rpc_address_outdated
    }

    /// When the node was last seen in the liveness registry. Only
    /// meaningful while [`NodeInfo::is_not_in_lookup`] holds.
    pub fn last_seen_in_lookup(&self) -> u64 {
        self.last_seen_in_lookup
    }

    /// Has an address, is registered, and last reported a state it can
    /// receive cluster states in.
    pub fn is_reachable(&self) -> bool {
        self.rpc_address.is_some()
            && !self.rpc_address_outdated
            && !self.reported_state.state().is_down_like()
    }

    // Reported and wanted state

    pub fn reported_state(&self) -> &NodeState {
        &self.reported_state
    }

    /// Whether the node has reported a state since we started gathering.
    pub fn has_reported_state(&self) -> bool {
        self.state_reported
    }

    /// Record a new reported state, maintaining the stable-state timers
    /// and the start timestamp the node had when it went down.
    pub fn set_reported_state(&mut self, state: NodeState, now: u64) {
        let previous = self.reported_state.state();
        let next = state.state();
        if next.is_down_like() && !previous.is_down_like() {
            self.went_down_with_start_time = self.reported_state.start_timestamp();
        }
        if next == State::Down && previous != State::Down {
            self.down_stable_state_time = now;
        } else if next == State::Up && previous != State::Up {
            self.up_stable_state_time = now;
        }
        if next == State::Up {
            self.recently_unstable_during_init = false;
        }
        self.reported_state = state;
        self.state_reported = true;
    }

    /// Forget the reported state, as if the node was never contacted.
    pub fn clear_reported_state(&mut self) {
        self.reported_state = Self::initial_reported_state(self.node);
        self.state_reported = false;
        self.pending_request = None;
    }

    /// Effective wanted state. Configured retirement caps anything above
    /// Retired.
    pub fn wanted_state(&self) -> NodeState {
        if self.configured_retired && self.wanted_state.state() > State::Retired {
            NodeState::new(self.node.node_type(), State::Retired)
                .with_description("Retired by configuration")
        } else {
            self.wanted_state.clone()
        }
    }

    /// Wanted state as set by an operator, ignoring configuration.
    pub fn user_wanted_state(&self) -> &NodeState {
        &self.wanted_state
    }

    pub fn set_wanted_state(&mut self, state: NodeState) {
        self.wanted_state = state;
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.host_info
    }

    pub fn set_host_info(&mut self, host_info: HostInfo) {
        self.host_info = host_info;
    }

    // Stability timers

    pub fn premature_crash_count(&self) -> u32 {
        self.premature_crash_count
    }

    pub fn set_premature_crash_count(&mut self, count: u32) {
        self.premature_crash_count = count;
    }

    pub fn transition_time(&self) -> u64 {
        self.transition_time
    }

    pub fn set_transition_time(&mut self, time: u64) {
        self.transition_time = time;
    }

    pub fn init_progress_time(&self) -> u64 {
        self.init_progress_time
    }

    pub fn set_init_progress_time(&mut self, time: u64) {
        self.init_progress_time = time;
    }

    pub fn up_stable_state_time(&self) -> u64 {
        self.up_stable_state_time
    }

    pub fn down_stable_state_time(&self) -> u64 {
        self.down_stable_state_time
    }

    pub fn recently_unstable_during_init(&self) -> bool {
        self.recently_unstable_during_init
    }

    pub fn set_recently_unstable_during_init(&mut self, unstable: bool) {
        self.recently_unstable_during_init = unstable;
    }

    /// Start timestamp every distributor is known to have observed.
    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn set_start_timestamp(&mut self, timestamp: u64) {
        self.start_timestamp = timestamp;
    }

    pub fn went_down_with_start_time(&self) -> u64 {
        self.went_down_with_start_time
    }

    // Node state polling

    pub fn pending_node_state_request(&self) -> Option<NodeStateRequest> {
        self.pending_request
    }

    pub(crate) fn set_pending_node_state_request(&mut self, request: Option<NodeStateRequest>) {
        self.pending_request = request;
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn next_attempt_time(&self) -> u64 {
        self.next_attempt_time
    }

    /// Record a failed request and schedule the next attempt. The first
    /// retry is immediate, then 100ms per consecutive failure, capped at
    /// 3s after ten failures.
    pub(crate) fn register_failed_attempt(&mut self, now: u64) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let delay = match self.failed_attempts {
            0 | 1 => 0,
            n if n <= 10 => 100 * u64::from(n),
            _ => 3_000,
        };
        self.next_attempt_time = now + delay;
    }

    pub(crate) fn register_successful_attempt(&mut self) {
        self.failed_attempts = 0;
        self.next_attempt_time = 0;
    }

    pub(crate) fn retry_immediately(&mut self) {
        self.next_attempt_time = 0;
    }

    pub fn rpc_version(&self) -> u8 {
        self.rpc_version
    }

    /// Step down one RPC dialect. Returns false when none is left.
    pub fn downgrade_rpc_version(&mut self) -> bool {
        if self.rpc_version > OLDEST_RPC_VERSION {
            self.rpc_version -= 1;
            true
        } else {
            false
        }
    }

    // Cluster state broadcast

    pub fn mark_state_version_sent(&mut self, version: u32, now: u64) {
        self.pending_state_versions.insert(version, now);
    }

    /// Time `version` was sent, if it is still outstanding.
    pub fn state_version_sent_at(&self, version: u32) -> Option<u64> {
        self.pending_state_versions.get(&version).copied()
    }

    pub fn has_pending_state_versions(&self) -> bool {
        !self.pending_state_versions.is_empty()
    }

    /// Acks are monotonic: an older ack never moves the acked version
    /// backwards.
    pub fn handle_state_version_ack(&mut self, version: u32) {
        self.state_version_acked = self.state_version_acked.max(version);
        let acked = self.state_version_acked;
        self.pending_state_versions.retain(|&v, _| v > acked);
    }

    pub fn handle_state_version_failure(&mut self, version: u32) {
        self.pending_state_versions.remove(&version);
    }

    pub fn state_version_acked(&self) -> u32 {
        self.state_version_acked
    }

    pub fn activation_version_sent(&self) -> u32 {
        self.activation_version_sent
    }

    pub fn mark_activation_sent(&mut self, version: u32) {
        self.activation_version_sent = version;
    }

    pub fn handle_activation_ack(&mut self, version: u32) {
        self.activation_version_acked = self.activation_version_acked.max(version);
    }

    pub fn handle_activation_failure(&mut self, version: u32) {
        if self.activation_version_sent == version {
            self.activation_version_sent = 0;
        }
    }

    pub fn activation_version_acked(&self) -> u32 {
        self.activation_version_acked
    }
}
