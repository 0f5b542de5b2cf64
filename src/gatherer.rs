//! Node state polling.
//!
//! The gatherer keeps at most one `getNodeState` request outstanding per
//! node and turns replies, including failures, into reported states.

use crate::cluster::{HostInfo, NodeInfo, NodeRegistry, NodeStateRequest};
use crate::communicator::{Communicator, GetNodeStateReply, RpcError};
use crate::observability;
use crate::state::{NodeState, State};
use tracing::{debug, warn};

/// What a node state reply amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum GatherOutcome {
    /// Stale, transient or otherwise uninformative.
    Ignored,
    /// The node downgraded its RPC dialect and is retried right away.
    Retry,
    /// A new reported state, plus host info when the node sent valid JSON.
    Reported {
        state: NodeState,
        host_info: Option<HostInfo>,
    },
}

#[derive(Debug, Clone)]
pub struct NodeStateGatherer {
    request_timeout: u64,
    next_request_id: u64,
}

impl NodeStateGatherer {
    pub fn new(request_timeout: u64) -> Self {
        Self {
            request_timeout,
            next_request_id: 1,
        }
    }

    pub fn set_request_timeout(&mut self, timeout: u64) {
        self.request_timeout = timeout;
    }

    /// Send requests to every node that is due one. Returns how many were
    /// sent.
    pub fn send_messages(
        &mut self,
        registry: &mut NodeRegistry,
        communicator: &dyn Communicator,
        now: u64,
    ) -> usize {
        let mut sent = 0;
        for info in registry.node_infos_mut() {
            if info.rpc_address().is_none() || info.is_not_in_lookup() {
                continue;
            }
            if let Some(request) = info.pending_node_state_request() {
                if request.sent_at + self.request_timeout > now {
                    continue;
                }
                debug!(node = %info.node(), request = request.id, "node state request timed out, resending");
            }
            if info.next_attempt_time() > now {
                continue;
            }

            let id = self.next_request_id;
            self.next_request_id += 1;
            info.set_pending_node_state_request(Some(NodeStateRequest { id, sent_at: now }));
            communicator.get_node_state(info, id);
            sent += 1;
        }
        sent
    }

    /// Interpret the reply to request `request_id`.
    pub fn handle_reply(
        &self,
        info: &mut NodeInfo,
        request_id: u64,
        result: Result<GetNodeStateReply, RpcError>,
        now: u64,
    ) -> GatherOutcome {
        if info.pending_node_state_request().map(|r| r.id) != Some(request_id) {
            debug!(node = %info.node(), request = request_id, "ignoring reply to superseded request");
            return GatherOutcome::Ignored;
        }
        info.set_pending_node_state_request(None);

        let error = match result {
            Ok(reply) => return self.handle_success(info, reply),
            Err(error) => error,
        };

        if error.is_transient() {
            debug!(node = %info.node(), error = %error, "transient node state failure");
            return GatherOutcome::Ignored;
        }
        observability::record_rpc_failure("get_node_state");

        let node_type = info.node_type();
        let state = match error {
            RpcError::NoSuchMethod => {
                if info.downgrade_rpc_version() {
                    debug!(node = %info.node(), version = info.rpc_version(), "downgraded RPC version");
                    info.retry_immediately();
                    return GatherOutcome::Retry;
                }
                NodeState::new(node_type, State::Down)
                    .with_description("Node does not support any known RPC version")
            }
            RpcError::Timeout => {
                NodeState::new(node_type, State::Down).with_description("RPC timeout")
            }
            RpcError::Connection(message) => NodeState::new(node_type, State::Down)
                .with_description(format!("Connection error: {}", message)),
            RpcError::NodeStopping(message) => {
                NodeState::new(node_type, State::Stopping).with_description(message)
            }
            RpcError::Other(message) => NodeState::new(node_type, State::Down)
                .with_description(format!("Failed to get node state: {}", message)),
            RpcError::Transient(_) | RpcError::Aborted => return GatherOutcome::Ignored,
        };
        info.register_failed_attempt(now);
        GatherOutcome::Reported {
            state,
            host_info: None,
        }
    }

    fn handle_success(&self, info: &mut NodeInfo, reply: GetNodeStateReply) -> GatherOutcome {
        info.register_successful_attempt();

        let state = if reply.state.state().valid_reported() {
            reply.state
        } else {
            warn!(node = %info.node(), state = %reply.state, "node reported an invalid state");
            NodeState::new(info.node_type(), State::Down)
                .with_description(format!("Node reported invalid state {}", reply.state.state()))
        };

        let host_info = reply.host_info.and_then(|json| match HostInfo::parse(&json) {
            Ok(host_info) => Some(host_info),
            Err(e) => {
                warn!(node = %info.node(), error = %e, "ignoring unparseable host info");
                None
            }
        });
        GatherOutcome::Reported { state, host_info }
    }
}
