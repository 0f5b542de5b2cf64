//! In-process cluster simulation.
//!
//! Controller replicas share one coordination store, one liveness registry
//! and one clock. Content nodes are simulated behind a recording
//! communicator: node state requests are held until the node's state
//! differs from what the controller last saw, cluster states are acked
//! unless acks are paused.

use super::fixtures::{replica_config, up, START_MILLIS};
use content_controller::clock::ManualClock;
use content_controller::cluster::{NodeInfo, SharedNodeLookup};
use content_controller::communicator::{ActivateReply, Communicator, GetNodeStateReply, RpcError};
use content_controller::config::ControllerConfig;
use content_controller::database::MemoryDatabase;
use content_controller::tasks::RemoteTask;
use content_controller::{
    ClusterState, ClusterStateBundle, Controller, ControllerEvent, ControllerServices, Node,
    NodeState,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// An outbound call seen by the communicator.
#[derive(Debug, Clone)]
pub enum Call {
    GetNodeState {
        node: Node,
        request_id: u64,
        known: NodeState,
    },
    SetClusterState {
        node: Node,
        bundle: ClusterStateBundle,
    },
    Activate {
        node: Node,
        version: u32,
    },
}

/// Records every call. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct FakeCommunicator {
    pending: Arc<Mutex<Vec<Call>>>,
    log: Arc<Mutex<Vec<Call>>>,
}

impl FakeCommunicator {
    fn record(&self, call: Call) {
        self.log.lock().push(call.clone());
        self.pending.lock().push(call);
    }

    /// Calls not yet answered by the simulation.
    pub fn take_pending(&self) -> Vec<Call> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Every call made so far.
    pub fn log(&self) -> Vec<Call> {
        self.log.lock().clone()
    }

    /// Versions of the cluster states sent to `node`, in send order.
    pub fn versions_sent_to(&self, node: Node) -> Vec<u32> {
        self.log
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::SetClusterState { node: n, bundle } if *n == node => Some(bundle.version()),
                _ => None,
            })
            .collect()
    }

    pub fn activations_sent(&self) -> Vec<(Node, u32)> {
        self.log
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Activate { node, version } => Some((*node, *version)),
                _ => None,
            })
            .collect()
    }
}

impl Communicator for FakeCommunicator {
    fn get_node_state(&self, node: &NodeInfo, request_id: u64) {
        self.record(Call::GetNodeState {
            node: node.node(),
            request_id,
            known: node.reported_state().clone(),
        });
    }

    fn set_cluster_state(&self, node: &NodeInfo, bundle: &ClusterStateBundle) {
        self.record(Call::SetClusterState {
            node: node.node(),
            bundle: bundle.clone(),
        });
    }

    fn activate_cluster_state_version(&self, node: &NodeInfo, version: u32) {
        self.record(Call::Activate {
            node: node.node(),
            version,
        });
    }
}

/// What a simulated content node does.
#[derive(Debug, Clone)]
struct SimulatedNode {
    state: NodeState,
    reachable: bool,
}

/// One controller replica and the node requests it has outstanding.
pub struct Replica {
    pub controller: Controller,
    pub communicator: FakeCommunicator,
    held_requests: BTreeMap<Node, (u64, NodeState)>,
    alive: bool,
}

impl Replica {
    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

pub struct SimulatedCluster {
    pub database: MemoryDatabase,
    pub lookup: SharedNodeLookup,
    pub clock: ManualClock,
    pub replicas: Vec<Replica>,
    nodes: BTreeMap<Node, SimulatedNode>,
    acks_enabled: bool,
}

impl SimulatedCluster {
    /// A cluster of `node_count` flat nodes, all up, and `replicas`
    /// controllers configured by [`replica_config`].
    pub fn new(node_count: u16, replicas: u32) -> Self {
        Self::with_config(node_count, replicas, |_| {})
    }

    /// Like [`SimulatedCluster::new`], with `configure` applied to every
    /// replica's configuration.
    pub fn with_config(
        node_count: u16,
        replicas: u32,
        configure: impl Fn(&mut ControllerConfig),
    ) -> Self {
        let database = MemoryDatabase::new();
        let lookup = SharedNodeLookup::new();
        let clock = ManualClock::new(START_MILLIS);

        let mut nodes = BTreeMap::new();
        for i in 0..node_count {
            for node in [Node::distributor(i), Node::storage(i)] {
                lookup.register(node, format!("tcp/{}", node));
                nodes.insert(
                    node,
                    SimulatedNode {
                        state: up(node),
                        reachable: true,
                    },
                );
            }
        }

        let replicas = (0..replicas)
            .map(|index| {
                let mut config = replica_config(node_count, index, replicas);
                configure(&mut config);
                let communicator = FakeCommunicator::default();
                let services = ControllerServices::new(
                    Arc::new(database.clone()),
                    Arc::new(communicator.clone()),
                    Box::new(lookup.clone()),
                )
                .with_clock(Arc::new(clock.clone()));
                Replica {
                    controller: Controller::new(config, services).expect("valid config"),
                    communicator,
                    held_requests: BTreeMap::new(),
                    alive: true,
                }
            })
            .collect();

        Self {
            database,
            lookup,
            clock,
            replicas,
            nodes,
            acks_enabled: true,
        }
    }

    pub fn controller(&self, index: usize) -> &Controller {
        &self.replicas[index].controller
    }

    pub fn communicator(&self, index: usize) -> &FakeCommunicator {
        &self.replicas[index].communicator
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Set what `node` reports from now on.
    pub fn set_node_state(&mut self, node: Node, state: NodeState) {
        if let Some(sim) = self.nodes.get_mut(&node) {
            sim.state = state;
        }
    }

    /// Make `node` refuse connections.
    pub fn kill_node(&mut self, node: Node) {
        if let Some(sim) = self.nodes.get_mut(&node) {
            sim.reachable = false;
        }
    }

    pub fn revive_node(&mut self, node: Node) {
        if let Some(sim) = self.nodes.get_mut(&node) {
            sim.reachable = true;
        }
    }

    /// While paused, cluster states and activations go unanswered.
    pub fn set_acks_enabled(&mut self, enabled: bool) {
        self.acks_enabled = enabled;
    }

    /// Stop ticking replica `index` and drop its vote, as when its
    /// process dies.
    pub fn stop_replica(&mut self, index: usize) {
        self.replicas[index].alive = false;
        self.database.remove_vote(index as u32);
    }

    pub fn schedule_task(&mut self, index: usize, task: Box<dyn RemoteTask>) {
        self.replicas[index].controller.schedule_remote_task(task);
    }

    /// Index of the live replica that considers itself master.
    pub fn master(&self) -> Option<usize> {
        self.replicas
            .iter()
            .position(|r| r.alive && r.controller.is_master())
    }

    pub fn published_state(&self, index: usize) -> &ClusterState {
        self.replicas[index].controller.published_state().baseline_state()
    }

    pub fn published_version(&self, index: usize) -> u32 {
        self.replicas[index].controller.published_state().version()
    }

    /// Tick replica `index` once, then let the nodes answer its calls.
    pub async fn tick(&mut self, index: usize) {
        self.replicas[index]
            .controller
            .tick()
            .await
            .expect("tick failed");
        self.respond(index);
    }

    /// Tick every live replica once, in index order.
    pub async fn tick_all(&mut self) {
        for index in 0..self.replicas.len() {
            if self.replicas[index].alive {
                self.tick(index).await;
            }
        }
    }

    pub async fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.tick_all().await;
        }
    }

    /// Tick all replicas until `done` holds, for at most `max_rounds`.
    pub async fn run_until(
        &mut self,
        max_rounds: usize,
        done: impl Fn(&SimulatedCluster) -> bool,
    ) -> bool {
        for _ in 0..max_rounds {
            if done(&*self) {
                return true;
            }
            self.tick_all().await;
        }
        done(&*self)
    }

    fn respond(&mut self, index: usize) {
        let Self {
            replicas,
            nodes,
            acks_enabled,
            ..
        } = self;
        let replica = &mut replicas[index];
        let sender = replica.controller.event_sender();
        let reachable = |node: &Node| nodes.get(node).map(|n| n.reachable).unwrap_or(false);
        let refused = || RpcError::Connection("refused".to_string());

        for call in replica.communicator.take_pending() {
            let event = match call {
                Call::GetNodeState {
                    node,
                    request_id,
                    known,
                } => {
                    replica.held_requests.insert(node, (request_id, known));
                    continue;
                }
                Call::SetClusterState { node, bundle } => {
                    let result = if !reachable(&node) {
                        Err(refused())
                    } else if *acks_enabled {
                        Ok(())
                    } else {
                        continue;
                    };
                    ControllerEvent::SetClusterStateReply {
                        node,
                        version: bundle.version(),
                        result,
                    }
                }
                Call::Activate { node, version } => {
                    let result = if !reachable(&node) {
                        Err(refused())
                    } else if *acks_enabled {
                        Ok(ActivateReply {
                            actual_version: version,
                        })
                    } else {
                        continue;
                    };
                    ControllerEvent::ActivateReply {
                        node,
                        version,
                        result,
                    }
                }
            };
            sender.send(event).expect("controller alive");
        }

        let held: Vec<(Node, u64, NodeState)> = replica
            .held_requests
            .iter()
            .map(|(node, (id, known))| (*node, *id, known.clone()))
            .collect();
        for (node, request_id, known) in held {
            let Some(sim) = nodes.get(&node) else {
                continue;
            };
            let result = if !sim.reachable {
                Err(refused())
            } else if sim.state != known {
                Ok(GetNodeStateReply {
                    state: sim.state.clone(),
                    host_info: None,
                })
            } else {
                continue;
            };
            replica.held_requests.remove(&node);
            sender
                .send(ControllerEvent::NodeStateReply {
                    node,
                    request_id,
                    result,
                })
                .expect("controller alive");
        }
    }
}
