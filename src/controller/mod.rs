//! The control loop.
//!
//! A [`Controller`] owns every piece of controller state and mutates it
//! from one task only. Each [`Controller::tick`] runs a fixed sequence:
//! 1. coordination store upkeep and master election
//! 2. leadership edges (restore metadata on gain, fail tasks on loss)
//! 3. liveness registry changes and node state polling
//! 4. queued replies, tasks and configuration
//! 5. stability timers and at most one remote task
//! 6. candidate state recomputation and publication
//! 7. persistence, broadcast and convergence tracking
//!
//! Other tasks talk to the loop through [`ControllerEvent`]s sent on the
//! channel from [`Controller::event_sender`].

mod event;

pub use event::{ControlLoopState, ControllerEvent, ControllerServices};

use crate::broadcast::SystemStateBroadcaster;
use crate::clock::millis;
use crate::cluster::NodeRegistry;
use crate::communicator::{GetNodeStateReply, RpcError};
use crate::config::ControllerConfig;
use crate::database::DatabaseHandler;
use crate::election::MasterElectionHandler;
use crate::error::{ControllerError, Result};
use crate::events::{EventLog, EventType};
use crate::gatherer::{GatherOutcome, NodeStateGatherer};
use crate::generator::{self, GeneratorParams, ResourceExhaustionCalculator};
use crate::observability;
use crate::state::{ClusterState, ClusterStateBundle, Node, NodeType};
use crate::state_change::{StateChangeHandler, StateChangeSettings};
use crate::tasks::{RemoteTask, TaskContext, TaskFailure, VersionDependentTaskCompletion};
use crate::tracker::{ClusterStateDeriver, StateVersionTracker};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A task that did its work and waits for the resulting state to be
/// computed before its version dependency is known.
#[derive(Debug)]
struct PendingRecomputeTask {
    deadline: u64,
    task: Box<dyn RemoteTask>,
}

pub struct Controller {
    config: ControllerConfig,
    services: ControllerServices,
    registry: NodeRegistry,
    events: EventLog,
    state_change: StateChangeHandler,
    tracker: StateVersionTracker,
    election: MasterElectionHandler,
    database: DatabaseHandler,
    gatherer: NodeStateGatherer,
    broadcaster: SystemStateBroadcaster,
    loop_state: ControlLoopState,
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
    event_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    buffered_events: VecDeque<ControllerEvent>,
    remote_tasks: VecDeque<Box<dyn RemoteTask>>,
    tasks_pending_state_recompute: Vec<PendingRecomputeTask>,
    deferred_tasks: Vec<VersionDependentTaskCompletion>,
    pending_config: Option<ControllerConfig>,
}

impl Controller {
    pub fn new(config: ControllerConfig, services: ControllerServices) -> Result<Self> {
        config.validate()?;
        let now = services.clock.now_millis();
        let timing = &config.timing;

        let registry = NodeRegistry::new(
            config.cluster_name.clone(),
            &config.nodes,
            config.distribution.clone(),
        );

        let mut tracker = StateVersionTracker::new(config.publishing.min_merge_completion_ratio);
        tracker.set_max_history_entries(config.publishing.max_history_entries);
        tracker.set_bucket_spaces(config.publishing.bucket_spaces.clone());
        tracker.set_node_sets(
            registry.indices(NodeType::Distributor),
            registry.indices(NodeType::Storage),
        );

        let mut state_change = StateChangeHandler::new(StateChangeSettings::from_config(&config));
        state_change.set_state_changed_flag();

        let election = MasterElectionHandler::new(
            config.controller.index,
            config.controller.count,
            millis(config.controller.master_cooldown_period),
            now,
        );
        let database = DatabaseHandler::new(services.database.clone(), config.controller.index);
        let gatherer = NodeStateGatherer::new(millis(timing.node_state_request_timeout));
        let broadcaster = SystemStateBroadcaster::new(
            millis(timing.set_cluster_state_timeout),
            config.publishing.max_divergent_nodes_printed,
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            cluster = %config.cluster_name,
            index = config.controller.index,
            controllers = config.controller.count,
            nodes = config.nodes.len(),
            "Controller created"
        );

        Ok(Self {
            events: EventLog::new(config.observability.max_events),
            config,
            services,
            registry,
            state_change,
            tracker,
            election,
            database,
            gatherer,
            broadcaster,
            loop_state: ControlLoopState::default(),
            event_tx,
            event_rx,
            buffered_events: VecDeque::new(),
            remote_tasks: VecDeque::new(),
            tasks_pending_state_recompute: Vec::new(),
            deferred_tasks: Vec::new(),
            pending_config: None,
        })
    }

    /// Sender for replies, remote tasks and configuration updates.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ControllerEvent> {
        self.event_tx.clone()
    }

    /// Queue a task directly, bypassing the event channel.
    pub fn schedule_remote_task(&mut self, task: Box<dyn RemoteTask>) {
        self.remote_tasks.push_back(task);
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn tracker(&self) -> &StateVersionTracker {
        &self.tracker
    }

    pub fn broadcaster(&self) -> &SystemStateBroadcaster {
        &self.broadcaster
    }

    pub fn election(&self) -> &MasterElectionHandler {
        &self.election
    }

    pub fn loop_state(&self) -> &ControlLoopState {
        &self.loop_state
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master(self.services.clock.now_millis())
    }

    /// The last published bundle.
    pub fn published_state(&self) -> &ClusterStateBundle {
        self.tracker.versioned_state()
    }

    /// Run one control loop cycle. Returns whether anything happened.
    /// Fails only when the controller must stop for good.
    pub async fn tick(&mut self) -> Result<bool> {
        let started = Instant::now();
        let now = self.services.clock.now_millis();
        let mut did_work = false;

        let is_master = self.election.is_master(now);
        did_work |= self
            .database
            .do_next_task(&mut self.election, &mut self.events, is_master, now)
            .await;
        if let Some(vote) = self.election.watch_master_election(now) {
            debug!(index = self.election.index(), vote, "changing master vote");
            self.database.set_master_vote(vote);
            did_work = true;
        }
        did_work |= self.handle_leadership_edges(now).await;

        let current = self.tracker.versioned_state().baseline_state().clone();
        did_work |= self.update_lookup(&current, now);
        did_work |= self.gather_node_states(now);
        did_work |= self.drain_events(&current, now);
        did_work |= self
            .state_change
            .watch_timers(&mut self.registry, &current, &mut self.events, now);
        did_work |= self.process_next_remote_task(&current, now);

        did_work |= self.recompute_candidate_if_required(now);
        did_work |= self.publish_candidate_if_required(now);
        self.schedule_tasks_pending_state_recompute();

        if self.state_change.has_unsaved_wanted_states()
            && self.election.is_master(now)
            && self.loop_state.metadata_loaded
        {
            self.database.save_wanted_states(self.registry.wanted_states());
        }
        did_work |= self.database.flush(self.election.is_master(now)).await;
        if self.database.take_wanted_states_stored() {
            self.state_change.mark_wanted_states_saved();
        }

        did_work |= self.broadcast_if_required(now);
        did_work |= self.complete_deferred_tasks(now);

        observability::update_task_queues(
            self.remote_tasks.len(),
            self.deferred_tasks.len() + self.tasks_pending_state_recompute.len(),
        );
        observability::record_tick(started.elapsed().as_millis() as u64, did_work);
        self.loop_state.cycle_count += 1;

        if let Some(config) = self.pending_config.take() {
            self.apply_config(config, now)?;
            did_work = true;
        }
        Ok(did_work)
    }

    /// Tick until `shutdown` turns true or a fatal error occurs. Idle
    /// ticks are followed by a sleep of the configured cycle wait time,
    /// cut short by incoming events.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(identity = %self.config.identity(), "Controller started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let did_work = match self.tick().await {
                Ok(did_work) => did_work,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Controller stopping");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Control loop tick failed");
                    false
                }
            };
            if did_work {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.buffered_events.push_back(event);
                }
                _ = tokio::time::sleep(self.config.controller.cycle_wait_time) => {}
            }
        }
        info!(identity = %self.config.identity(), "Controller stopped");
        Ok(())
    }

    async fn handle_leadership_edges(&mut self, now: u64) -> bool {
        let is_master = self.election.is_master(now);
        if is_master == self.loop_state.was_master {
            if is_master && !self.loop_state.metadata_loaded {
                return self.load_master_metadata().await;
            }
            return false;
        }

        self.loop_state.was_master = is_master;
        self.events.set_master(is_master);
        self.events
            .add_cluster_event(EventType::MasterElection, self.election.describe(now), now);
        observability::update_master_state(is_master);
        observability::record_leadership_change(is_master);

        if is_master {
            info!(index = self.election.index(), "Became master");
            self.loop_state.became_master_at = now;
            self.loop_state.metadata_loaded = false;
            self.loop_state.published_as_master = false;
            self.broadcaster.clear();
            self.load_master_metadata().await;
        } else {
            info!(index = self.election.index(), "Lost master role");
            self.loop_state.metadata_loaded = false;
            self.fail_all_tasks(TaskFailure::LeadershipLost);
        }
        true
    }

    async fn load_master_metadata(&mut self) -> bool {
        match self.database.load_master_metadata().await {
            Ok(metadata) => {
                self.tracker
                    .set_version_retrieved_from_store(metadata.latest_version);
                if let Some(bundle) = &metadata.state_bundle {
                    self.tracker
                        .set_cluster_state_bundle_retrieved_from_store(bundle);
                }
                // Wanted states set here but never stored, such as by the
                // crash circuit breaker while not master, survive the load.
                let unsaved = self
                    .state_change
                    .has_unsaved_wanted_states()
                    .then(|| self.registry.wanted_states());
                self.registry.apply_wanted_states(&metadata.wanted_states);
                for (node, state) in unsaved.into_iter().flatten() {
                    if metadata.wanted_states.contains_key(&node) {
                        continue;
                    }
                    if let Some(info) = self.registry.get_mut(node) {
                        info.set_wanted_state(state);
                    }
                }
                self.registry
                    .apply_start_timestamps(&metadata.start_timestamps);
                self.state_change.set_state_changed_flag();
                self.loop_state.metadata_loaded = true;
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to load cluster state metadata, retrying next tick");
                false
            }
        }
    }

    fn fail_all_tasks(&mut self, failure: TaskFailure) {
        let tasks = self
            .remote_tasks
            .drain(..)
            .chain(self.tasks_pending_state_recompute.drain(..).map(|p| p.task))
            .chain(self.deferred_tasks.drain(..).map(|d| d.task));
        let mut failed = 0;
        for mut task in tasks {
            task.handle_failure(failure.clone());
            failed += 1;
        }
        if failed > 0 {
            warn!(failed, failure = %failure, "Failed queued remote tasks");
            for _ in 0..failed {
                observability::record_task_failure(failure.kind());
            }
        }
    }

    fn update_lookup(&mut self, current: &ClusterState, now: u64) -> bool {
        let changes = self.services.lookup.update_cluster(&mut self.registry, now);
        for change in &changes {
            if let Some(info) = self.registry.get_mut(change.node()) {
                self.state_change
                    .handle_lookup_change(current, info, change, &mut self.events, now);
            }
        }
        !changes.is_empty()
    }

    fn gather_node_states(&mut self, now: u64) -> bool {
        let gatherer = self
            .election
            .is_among_nth_first(self.config.controller.state_gather_count);
        if gatherer != self.loop_state.is_state_gatherer {
            self.loop_state.is_state_gatherer = gatherer;
            if gatherer {
                info!(index = self.election.index(), "Started gathering node states");
            } else {
                info!(index = self.election.index(), "Stopped gathering node states");
                self.registry.clear_reported_states();
                self.state_change.set_state_changed_flag();
            }
        }
        if !gatherer {
            return false;
        }
        self.gatherer
            .send_messages(&mut self.registry, self.services.communicator.as_ref(), now)
            > 0
    }

    fn drain_events(&mut self, current: &ClusterState, now: u64) -> bool {
        while let Ok(event) = self.event_rx.try_recv() {
            self.buffered_events.push_back(event);
        }
        let did_work = !self.buffered_events.is_empty();
        while let Some(event) = self.buffered_events.pop_front() {
            self.handle_event(event, current, now);
        }
        did_work
    }

    fn handle_event(&mut self, event: ControllerEvent, current: &ClusterState, now: u64) {
        match event {
            ControllerEvent::NodeStateReply {
                node,
                request_id,
                result,
            } => self.handle_node_state_reply(current, node, request_id, result, now),
            ControllerEvent::SetClusterStateReply {
                node,
                version,
                result,
            } => {
                if let Some(info) = self.registry.get_mut(node) {
                    self.broadcaster.handle_set_cluster_state_reply(
                        info,
                        version,
                        result,
                        &mut self.events,
                        now,
                    );
                }
            }
            ControllerEvent::ActivateReply {
                node,
                version,
                result,
            } => {
                if let Some(info) = self.registry.get_mut(node) {
                    self.broadcaster
                        .handle_activate_reply(info, version, result, &mut self.events, now);
                }
            }
            ControllerEvent::RemoteTask(task) => self.remote_tasks.push_back(task),
            ControllerEvent::Reconfigure(config) => self.pending_config = Some(*config),
        }
    }

    fn handle_node_state_reply(
        &mut self,
        current: &ClusterState,
        node: Node,
        request_id: u64,
        result: std::result::Result<GetNodeStateReply, RpcError>,
        now: u64,
    ) {
        let Some(info) = self.registry.get_mut(node) else {
            debug!(node = %node, "reply from unconfigured node");
            return;
        };
        let (state, host_info) = match self.gatherer.handle_reply(info, request_id, result, now) {
            GatherOutcome::Ignored | GatherOutcome::Retry => return,
            GatherOutcome::Reported { state, host_info } => (state, host_info),
        };

        if let Some(host_info) = host_info {
            let feed_block = &self.config.feed_block;
            if feed_block.enabled {
                let calculator = ResourceExhaustionCalculator::new(
                    &feed_block.limits,
                    feed_block.noise_level,
                    self.tracker.latest_candidate().feed_block(),
                );
                if calculator.exhaustion_set_changes(info, &host_info) {
                    self.state_change.set_state_changed_flag();
                }
            }
            if info.is_distributor() {
                self.tracker.handle_updated_host_info(info.index(), &host_info);
            }
            info.set_host_info(host_info);
        }
        self.state_change
            .handle_new_reported_node_state(current, info, state, &mut self.events, now);
    }

    fn process_next_remote_task(&mut self, current: &ClusterState, now: u64) -> bool {
        let Some(mut task) = self.remote_tasks.pop_front() else {
            return false;
        };
        if !self.election.is_master(now) {
            debug!("not master, failing remote task");
            let failure = TaskFailure::LeadershipLost;
            observability::record_task_failure(failure.kind());
            task.handle_failure(failure);
            return true;
        }

        let mut ctx = TaskContext {
            registry: &mut self.registry,
            state_change: &mut self.state_change,
            current,
            events: &mut self.events,
            now,
        };
        match task.do_work(&mut ctx) {
            Err(failure) => {
                debug!(failure = %failure, "remote task failed");
                observability::record_task_failure(failure.kind());
                task.handle_failure(failure);
            }
            Ok(()) if task.has_version_ack_dependency() => {
                let wait_time = task
                    .deadline()
                    .unwrap_or(self.config.timing.max_deferred_task_version_wait_time);
                let deadline = now + millis(wait_time);
                self.tasks_pending_state_recompute
                    .push(PendingRecomputeTask { deadline, task });
            }
            Ok(()) => task.notify_completed(),
        }
        true
    }

    fn recompute_candidate_if_required(&mut self, now: u64) -> bool {
        if self.config.publishing.maintenance_on_pending_global_merges
            && self.tracker.bucket_space_merge_completion_state_has_changed()
        {
            self.state_change.set_state_changed_flag();
        }
        if !self.state_change.state_may_have_changed() {
            return false;
        }

        let params = GeneratorParams::from_config(&self.config, &self.registry)
            .current_time(now)
            .lowest_observed_distribution_bits(self.tracker.lowest_observed_distribution_bits());
        let baseline = generator::generate(&params);

        let feed_block = &self.config.feed_block;
        let feed_block = if feed_block.enabled {
            ResourceExhaustionCalculator::new(
                &feed_block.limits,
                feed_block.noise_level,
                self.tracker.latest_candidate().feed_block(),
            )
            .infer_feed_block(&self.registry)
        } else {
            None
        };

        let deriver = if self.config.publishing.maintenance_on_pending_global_merges {
            ClusterStateDeriver::maintenance_when_pending_global_merges(
                &self.tracker.merge_pending_checker(),
                self.registry.indices(NodeType::Storage),
            )
        } else {
            ClusterStateDeriver::Identity
        };

        let candidate = ClusterStateBundle::builder(baseline)
            .bucket_spaces(self.tracker.bucket_spaces().to_vec())
            .deriver(deriver)
            .feed_block(feed_block)
            .deferred_activation(self.config.publishing.two_phase_activation)
            .derive_and_build();
        debug!(candidate = %candidate, "computed candidate cluster state");
        self.tracker.update_latest_candidate_state_bundle(candidate);
        self.state_change.unset_state_changed_flag();
        true
    }

    fn publish_candidate_if_required(&mut self, now: u64) -> bool {
        if !self.election.is_master(now) || !self.loop_state.metadata_loaded {
            return false;
        }
        if !self.tracker.has_received_new_version_from_store()
            && !self
                .tracker
                .candidate_changed_enough_from_current_to_warrant_publish()
        {
            return false;
        }
        if !self.may_publish_now(now) {
            return false;
        }

        let previous = self.tracker.versioned_state().baseline_state().clone();
        let bundle = self.tracker.promote_candidate_to_versioned_state(now).clone();
        self.emit_state_change_events(&previous, bundle.baseline_state(), now);

        self.loop_state.last_state_broadcast = now;
        self.loop_state.published_as_master = true;
        self.database.save_latest_version(bundle.version());
        self.database.save_state_bundle(bundle.clone());
        self.broadcaster.handle_new_cluster_states(bundle);
        true
    }

    /// The first state after becoming master waits until every node has
    /// reported or the configured delay has passed. Later states are
    /// rate limited.
    fn may_publish_now(&self, now: u64) -> bool {
        let timing = &self.config.timing;
        if !self.loop_state.published_as_master {
            let first = self.loop_state.became_master_at
                + millis(timing.min_time_before_first_state_broadcast);
            if now < first && !self.registry.all_states_reported() {
                return false;
            }
            return true;
        }
        now >= self.loop_state.last_state_broadcast + millis(timing.min_time_between_new_states)
    }

    fn emit_state_change_events(&mut self, previous: &ClusterState, next: &ClusterState, now: u64) {
        if previous.cluster_state() != next.cluster_state() {
            self.events.add_cluster_event(
                EventType::SystemState,
                format!(
                    "Cluster state changed from {} to {}",
                    previous.cluster_state(),
                    next.cluster_state()
                ),
                now,
            );
        }
        for node in self.registry.nodes() {
            let before = previous.node_state(node);
            let after = next.node_state(node);
            if before.state() != after.state() {
                self.events.add_node_event(
                    node,
                    EventType::NodeCurrent,
                    format!(
                        "Altered node state in cluster state from '{}' to '{}'",
                        before, after
                    ),
                    now,
                );
            }
        }
    }

    /// Tasks wait here until whatever they changed has made it into a
    /// published version, or it turned out nothing changed.
    fn schedule_tasks_pending_state_recompute(&mut self) {
        if self.tasks_pending_state_recompute.is_empty()
            || self.state_change.state_may_have_changed()
            || self
                .tracker
                .candidate_changed_enough_from_current_to_warrant_publish()
        {
            return;
        }
        let version = self.tracker.current_version();
        for pending in self.tasks_pending_state_recompute.drain(..) {
            debug!(version, "task waits for version to converge");
            self.deferred_tasks.push(VersionDependentTaskCompletion::new(
                version,
                pending.deadline,
                pending.task,
            ));
        }
    }

    fn broadcast_if_required(&mut self, now: u64) -> bool {
        if !self.election.is_master(now) || !self.loop_state.published_as_master {
            return false;
        }
        let communicator = self.services.communicator.as_ref();
        let mut did_work = false;

        if !self.database.has_pending_cluster_state_metadata_store() {
            did_work |= self.broadcaster.broadcast_new_state_bundle_if_required(
                &mut self.registry,
                communicator,
                self.database.stored_version(),
                &mut self.events,
                now,
            );
        }
        did_work |= self
            .broadcaster
            .broadcast_state_activations_if_required(&mut self.registry, communicator);

        if let Some(version) = self
            .broadcaster
            .check_if_cluster_state_is_acked_by_all_distributors(&self.registry)
        {
            self.events.add_cluster_event(
                EventType::SystemState,
                format!("Cluster state version {} has converged on all distributors", version),
                now,
            );
            let converged = self.broadcaster.cluster_state_bundle().baseline_state().clone();
            let recorded = self.state_change.handle_all_distributors_in_sync(
                &converged,
                &mut self.registry,
                &mut self.events,
                now,
            );
            if recorded > 0 {
                self.database
                    .save_start_timestamps(self.registry.start_timestamps());
            }
            did_work = true;
        }
        did_work
    }

    fn complete_deferred_tasks(&mut self, now: u64) -> bool {
        if self.deferred_tasks.is_empty() && self.tasks_pending_state_recompute.is_empty() {
            return false;
        }
        let converged = self.broadcaster.last_converged_version();
        let mut did_work = false;

        let mut waiting = Vec::with_capacity(self.deferred_tasks.len());
        for mut deferred in self.deferred_tasks.drain(..) {
            if deferred.is_satisfied_by(converged) {
                debug!(version = deferred.min_version, "completing version dependent task");
                deferred.task.notify_completed();
                did_work = true;
            } else if deferred.is_expired(now) {
                let failure = TaskFailure::DeadlineExceeded(format!(
                    "version {} did not converge before its deadline, {}",
                    deferred.min_version,
                    self.broadcaster.divergent_nodes_description(&self.registry)
                ));
                warn!(version = deferred.min_version, "remote task deadline exceeded");
                observability::record_task_failure(failure.kind());
                deferred.task.handle_failure(failure);
                did_work = true;
            } else {
                waiting.push(deferred);
            }
        }
        self.deferred_tasks = waiting;

        let mut still_pending = Vec::with_capacity(self.tasks_pending_state_recompute.len());
        for mut pending in self.tasks_pending_state_recompute.drain(..) {
            if now >= pending.deadline {
                let failure = TaskFailure::DeadlineExceeded(
                    "no cluster state was published before the deadline".to_string(),
                );
                observability::record_task_failure(failure.kind());
                pending.task.handle_failure(failure);
                did_work = true;
            } else {
                still_pending.push(pending);
            }
        }
        self.tasks_pending_state_recompute = still_pending;
        did_work
    }

    fn apply_config(&mut self, config: ControllerConfig, now: u64) -> Result<()> {
        if config.identity() != self.config.identity() {
            let err = ControllerError::IdentityChanged {
                old: self.config.identity(),
                new: config.identity(),
            };
            error!(error = %err, "Refusing configuration");
            return Err(err);
        }
        if let Err(e) = config.validate() {
            warn!(error = %e, "Ignoring invalid configuration");
            return Ok(());
        }

        let removed = self
            .registry
            .set_nodes(&config.nodes, config.distribution.clone());
        self.tracker.set_node_sets(
            self.registry.indices(NodeType::Distributor),
            self.registry.indices(NodeType::Storage),
        );
        self.tracker
            .set_max_history_entries(config.publishing.max_history_entries);
        self.tracker
            .set_bucket_spaces(config.publishing.bucket_spaces.clone());
        self.tracker
            .set_min_merge_completion_ratio(config.publishing.min_merge_completion_ratio);

        self.state_change
            .reconfigure(StateChangeSettings::from_config(&config));
        self.state_change.set_state_changed_flag();
        self.election.set_controller_count(config.controller.count);
        self.election
            .set_cooldown(millis(config.controller.master_cooldown_period));
        self.gatherer
            .set_request_timeout(millis(config.timing.node_state_request_timeout));
        self.broadcaster.reconfigure(
            millis(config.timing.set_cluster_state_timeout),
            config.publishing.max_divergent_nodes_printed,
        );

        self.events.add_cluster_event(
            EventType::Cluster,
            format!(
                "Applied new configuration with {} nodes ({} removed)",
                config.nodes.len(),
                removed.len()
            ),
            now,
        );
        self.config = config;
        Ok(())
    }
}
