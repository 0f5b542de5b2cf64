//! Temporal bookkeeping that feeds the generator.
//!
//! The [`StateChangeHandler`] sees every reported state, liveness change
//! and operator request before the generator runs. It maintains per-node
//! timers and crash counters on [`NodeInfo`] and raises a single dirty flag
//! whenever the next generated state may differ from the last one.
//!
//! Flapping nodes are handled by a circuit breaker: a node that goes down
//! too soon after coming up too many times in a row gets its wanted state
//! set to Down.

use crate::clock::millis;
use crate::cluster::{LookupChange, NodeInfo, NodeRegistry};
use crate::config::{ControllerConfig, StatePolicyConfig, TimingConfig};
use crate::error::{ControllerError, Result};
use crate::events::{EventLog, EventType};
use crate::observability;
use crate::state::{ClusterState, NodeState, NodeType, State};
use tracing::{debug, info, warn};

const SIGTERM_DESCRIPTION: &str = "Received signal 15 (SIGTERM - Termination signal)";
const CONTROLLED_SHUTDOWN_DESCRIPTION: &str = "controlled shutdown";

/// Timer and policy settings for the handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateChangeSettings {
    pub max_premature_crashes: u32,
    pub stable_state_time_period: u64,
    pub max_init_progress_time: u64,
    pub max_lookup_disconnect_grace_period: u64,
    pub storage_transition_time: u64,
    pub distributor_transition_time: u64,
}

impl StateChangeSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::from_sections(&config.timing, &config.policy)
    }

    pub fn from_sections(timing: &TimingConfig, policy: &StatePolicyConfig) -> Self {
        Self {
            max_premature_crashes: policy.max_premature_crashes,
            stable_state_time_period: millis(timing.stable_state_time_period),
            max_init_progress_time: millis(timing.max_init_progress_time),
            max_lookup_disconnect_grace_period: millis(timing.max_lookup_disconnect_grace_period),
            storage_transition_time: millis(timing.storage_transition_time),
            distributor_transition_time: millis(timing.distributor_transition_time),
        }
    }

    fn transition_time(&self, node_type: NodeType) -> u64 {
        match node_type {
            NodeType::Storage => self.storage_transition_time,
            NodeType::Distributor => self.distributor_transition_time,
        }
    }
}

impl Default for StateChangeSettings {
    fn default() -> Self {
        Self::from_sections(&TimingConfig::default(), &StatePolicyConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct StateChangeHandler {
    settings: StateChangeSettings,
    state_may_have_changed: bool,
    wanted_state_changed: bool,
}

impl StateChangeHandler {
    pub fn new(settings: StateChangeSettings) -> Self {
        Self {
            settings,
            state_may_have_changed: false,
            wanted_state_changed: false,
        }
    }

    pub fn reconfigure(&mut self, settings: StateChangeSettings) {
        if self.settings != settings {
            self.settings = settings;
            self.state_may_have_changed = true;
        }
    }

    pub fn settings(&self) -> &StateChangeSettings {
        &self.settings
    }

    pub fn state_may_have_changed(&self) -> bool {
        self.state_may_have_changed
    }

    pub fn set_state_changed_flag(&mut self) {
        self.state_may_have_changed = true;
    }

    pub fn unset_state_changed_flag(&mut self) {
        self.state_may_have_changed = false;
    }

    /// Whether some wanted state changed and has not been stored yet.
    pub fn has_unsaved_wanted_states(&self) -> bool {
        self.wanted_state_changed
    }

    /// Called once the wanted states are durably stored.
    pub fn mark_wanted_states_saved(&mut self) {
        self.wanted_state_changed = false;
    }

    /// Record a freshly reported state for `info`.
    pub fn handle_new_reported_node_state(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        reported: NodeState,
        events: &mut EventLog,
        now: u64,
    ) {
        let node = info.node();
        let last = info.reported_state().clone();

        if !reported.similar_to(&last) {
            if reported.state() == State::Down {
                events.add_node_event(
                    node,
                    EventType::NodeReported,
                    format!("Failed to get node state: {}", reported),
                    now,
                );
            } else {
                events.add_node_event(
                    node,
                    EventType::NodeReported,
                    format!("Now reporting state {}", reported),
                    now,
                );
            }
        }

        if info.has_reported_state()
            && reported == last
            && reported.state() != State::Initializing
        {
            return;
        }

        if reported.state() == State::Initializing
            && (last.state() != State::Initializing
                || reported.init_progress() != last.init_progress())
        {
            info.set_init_progress_time(now);
        }

        let controlled = is_controlled_shutdown(&reported);
        if last.state() == State::Initializing && !controlled {
            if reported.state() == State::Down {
                info.set_recently_unstable_during_init(true);
                self.handle_premature_crash(info, events, now);
            } else if reported.state() == State::Initializing
                && reported.init_progress() < last.init_progress()
            {
                events.add_node_event(
                    node,
                    EventType::NodeReported,
                    format!(
                        "Stop or crash during initialization detected: init progress went from {:.3} to {:.3}",
                        last.init_progress(),
                        reported.init_progress()
                    ),
                    now,
                );
                info.set_recently_unstable_during_init(true);
                self.handle_premature_crash(info, events, now);
            }
        }

        if last.state() == State::Up
            && matches!(
                reported.state(),
                State::Down | State::Stopping | State::Initializing
            )
        {
            info.set_transition_time(now);
            if !controlled
                && info.up_stable_state_time() + self.settings.stable_state_time_period > now
            {
                debug!(node = %node, "premature crash, node was up for {}ms",
                    now.saturating_sub(info.up_stable_state_time()));
                self.handle_premature_crash(info, events, now);
            }
        }

        let current_state = current.node_state(node);
        if reported.min_used_bits() != current_state.min_used_bits() {
            debug!(node = %node, bits = reported.min_used_bits(), "node reports new min used bits");
        }

        info.set_reported_state(reported, now);
        self.state_may_have_changed = true;
    }

    fn handle_premature_crash(&mut self, info: &mut NodeInfo, events: &mut EventLog, now: u64) {
        let count = info.premature_crash_count().saturating_add(1);
        info.set_premature_crash_count(count);

        // A zero limit turns the circuit breaker off.
        let max = self.settings.max_premature_crashes;
        if max == 0 || count <= max || info.user_wanted_state().state() == State::Down {
            return;
        }

        let description = format!(
            "Disabled by fleet controller as it prematurely shut down {} times in a row",
            count
        );
        warn!(node = %info.node(), crashes = count, "disabling unstable node");
        info.set_wanted_state(
            NodeState::new(info.node_type(), State::Down).with_description(description.clone()),
        );
        events.add_node_event(info.node(), EventType::NodeWanted, description, now);
        observability::record_node_disabled();
        self.wanted_state_changed = true;
        self.state_may_have_changed = true;
    }

    /// Apply an operator's wanted state to `info`.
    pub fn propose_new_node_state(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        proposed: NodeState,
        events: &mut EventLog,
        now: u64,
    ) -> Result<()> {
        let node = info.node();
        if !proposed.state().valid_wanted_for(node.node_type()) {
            return Err(ControllerError::InvalidNodeState {
                node: node.to_string(),
                reason: format!("{} is not a valid wanted state", proposed.state()),
            });
        }

        let previous = info.user_wanted_state().clone();
        if previous.state() == proposed.state() && previous.description() == proposed.description()
        {
            return Ok(());
        }

        if proposed.above(info.reported_state()) {
            events.add_node_event(
                node,
                EventType::NodeWanted,
                format!(
                    "Wanted state {}, but we cannot force node into that state yet as it is not properly up",
                    proposed
                ),
                now,
            );
        }
        events.add_node_event(
            node,
            EventType::NodeWanted,
            format!("Altered wanted state from {} to {}", previous, proposed),
            now,
        );

        if current.node_state(node).state() != proposed.state() {
            self.state_may_have_changed = true;
        }
        if proposed.state() == State::Up {
            // Operator re-enabled the node; forget the crash history.
            info.set_premature_crash_count(0);
        }
        info.set_wanted_state(proposed);
        self.wanted_state_changed = true;
        Ok(())
    }

    /// React to one liveness registry change.
    pub fn handle_lookup_change(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        change: &LookupChange,
        events: &mut EventLog,
        now: u64,
    ) {
        match change {
            LookupChange::NewNode(_) => self.handle_new_node(info, events, now),
            LookupChange::MissingNode(_) => self.handle_missing_node(current, info, events, now),
            LookupChange::NewAddress(_) => self.handle_new_address(info, events, now),
            LookupChange::ReturnedAddress(_) => self.handle_returned_address(info, events, now),
        }
    }

    pub fn handle_new_node(&mut self, info: &mut NodeInfo, events: &mut EventLog, now: u64) {
        events.add_node_event(
            info.node(),
            EventType::NodeLiveness,
            format!(
                "Node registered in liveness registry at {}",
                info.rpc_address().unwrap_or("unknown address")
            ),
            now,
        );
        self.state_may_have_changed = true;
    }

    /// A node left the liveness registry. One that was stopping has shut
    /// down in an orderly fashion and is taken down right away.
    pub fn handle_missing_node(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        events: &mut EventLog,
        now: u64,
    ) {
        if info.reported_state().state() == State::Stopping {
            events.add_node_event(
                info.node(),
                EventType::NodeLiveness,
                "Node is no longer in liveness registry. Was in stopping state, so assuming it has shut down normally. Setting node down",
                now,
            );
            let mut down = info.reported_state().clone();
            down.set_state(State::Down);
            info.set_pending_node_state_request(None);
            self.handle_new_reported_node_state(current, info, down, events, now);
        } else {
            events.add_node_event(
                info.node(),
                EventType::NodeLiveness,
                "Node is no longer in liveness registry",
                now,
            );
        }
        self.state_may_have_changed = true;
    }

    pub fn handle_new_address(&mut self, info: &mut NodeInfo, events: &mut EventLog, now: u64) {
        events.add_node_event(
            info.node(),
            EventType::NodeLiveness,
            format!(
                "Node got new address {} in liveness registry",
                info.rpc_address().unwrap_or("unknown address")
            ),
            now,
        );
        info.set_pending_node_state_request(None);
        info.retry_immediately();
        self.state_may_have_changed = true;
    }

    pub fn handle_returned_address(&mut self, info: &mut NodeInfo, events: &mut EventLog, now: u64) {
        events.add_node_event(
            info.node(),
            EventType::NodeLiveness,
            "Node got back into liveness registry with same address as before",
            now,
        );
        self.state_may_have_changed = true;
    }

    /// Run the per-node timers. Returns whether any of them fired.
    pub fn watch_timers(
        &mut self,
        registry: &mut NodeRegistry,
        current: &ClusterState,
        events: &mut EventLog,
        now: u64,
    ) -> bool {
        let mut triggered = false;
        for info in registry.node_infos_mut() {
            triggered |= self.check_lookup_timeout(current, info, events, now);
            triggered |= self.check_maintenance_transition_timeout(current, info, events, now);
            triggered |= self.check_init_progress_timeout(current, info, events, now);
            triggered |= self.check_stable_state_reset(info, events, now);
        }
        if triggered {
            self.state_may_have_changed = true;
        }
        triggered
    }

    fn check_lookup_timeout(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        events: &mut EventLog,
        now: u64,
    ) -> bool {
        let grace = self.settings.max_lookup_disconnect_grace_period;
        if !info.is_not_in_lookup()
            || info.reported_state().state() == State::Down
            || info.last_seen_in_lookup() + grace > now
        {
            return false;
        }
        let down = NodeState::new(info.node_type(), State::Down)
            .with_description(format!("Node not seen in liveness registry for the last {}ms", grace));
        info.set_pending_node_state_request(None);
        self.handle_new_reported_node_state(current, info, down, events, now);
        true
    }

    /// A node held in Maintenance by the grace period that still has not
    /// come back must be re-evaluated so it can go Down.
    fn check_maintenance_transition_timeout(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        events: &mut EventLog,
        now: u64,
    ) -> bool {
        let transition_time = self.settings.transition_time(info.node_type());
        let in_maintenance = current.node_state(info.node()).state() == State::Maintenance;
        let wanted_above_down = info.wanted_state().state() > State::Down;
        let out_of_contact =
            info.reported_state().state() == State::Down || info.is_not_in_lookup();
        if transition_time == 0
            || !in_maintenance
            || !wanted_above_down
            || !out_of_contact
            || info.transition_time() + transition_time >= now
        {
            return false;
        }
        events.add_node_event(
            info.node(),
            EventType::NodeCurrent,
            format!(
                "Node has been in maintenance mode too long ({}ms). Setting node down",
                now.saturating_sub(info.transition_time())
            ),
            now,
        );
        true
    }

    fn check_init_progress_timeout(
        &mut self,
        current: &ClusterState,
        info: &mut NodeInfo,
        events: &mut EventLog,
        now: u64,
    ) -> bool {
        let max = self.settings.max_init_progress_time;
        if max == 0
            || !info.is_storage()
            || info.reported_state().state() != State::Initializing
            || info.init_progress_time() + max > now
        {
            return false;
        }
        info!(node = %info.node(), "node has not progressed initialization for {}ms", max);
        let down = NodeState::new(info.node_type(), State::Down).with_description(format!(
            "{}ms without initialize progress. Assuming node has deadlocked",
            max
        ));
        info.set_pending_node_state_request(None);
        info.set_recently_unstable_during_init(true);
        // Leaving Initializing for Down counts the premature crash.
        self.handle_new_reported_node_state(current, info, down, events, now);
        true
    }

    fn check_stable_state_reset(&mut self, info: &mut NodeInfo, events: &mut EventLog, now: u64) -> bool {
        if info.premature_crash_count() == 0 {
            return false;
        }
        let period = self.settings.stable_state_time_period;
        let stable_since = match info.reported_state().state() {
            State::Up => info.up_stable_state_time(),
            State::Down => info.down_stable_state_time(),
            _ => return false,
        };
        if stable_since + period > now {
            return false;
        }
        events.add_node_event(
            info.node(),
            EventType::NodeReported,
            format!(
                "Node has been in state {} for {}ms, resetting premature crash count from {}",
                info.reported_state().state(),
                period,
                info.premature_crash_count()
            ),
            now,
        );
        info.set_premature_crash_count(0);
        true
    }

    /// Every distributor acknowledged `converged`. Start timestamps it
    /// carries are now known everywhere and can be recorded, so the
    /// generator stops repeating them. Returns how many were recorded.
    pub fn handle_all_distributors_in_sync(
        &mut self,
        converged: &ClusterState,
        registry: &mut NodeRegistry,
        events: &mut EventLog,
        now: u64,
    ) -> usize {
        let mut reset = 0;
        for info in registry.node_infos_mut() {
            let observed = converged.node_state(info.node()).start_timestamp();
            if observed > info.start_timestamp() {
                info.set_start_timestamp(observed);
                reset += 1;
            }
        }
        if reset > 0 {
            events.add_cluster_event(
                EventType::SystemState,
                format!(
                    "Reset {} start timestamps as all available distributors have seen newest cluster state",
                    reset
                ),
                now,
            );
            self.state_may_have_changed = true;
        }
        reset
    }
}

/// Shutdowns the node announced itself do not count as crashes.
fn is_controlled_shutdown(state: &NodeState) -> bool {
    state.state() == State::Stopping
        && (state.description().contains(SIGTERM_DESCRIPTION)
            || state.description().contains(CONTROLLED_SHUTDOWN_DESCRIPTION))
}
