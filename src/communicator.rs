//! Node transport seam.
//!
//! Calls are fire and forget: an implementation sends the request and later
//! delivers the outcome to the control loop as a
//! [`ControllerEvent`](crate::controller::ControllerEvent) through the
//! sender obtained from
//! [`Controller::event_sender`](crate::controller::Controller::event_sender).
//! Wire encoding is left to the implementation.

use crate::cluster::NodeInfo;
use crate::state::{ClusterStateBundle, NodeState};
use thiserror::Error;

/// Failure of a single RPC to a node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC timeout")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    /// The node does not know the method in the dialect we spoke.
    #[error("No such method")]
    NoSuchMethod,

    /// The node refuses requests because it is shutting down.
    #[error("{0}")]
    NodeStopping(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Request aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

impl RpcError {
    /// Whether the error says nothing about the node's health.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transient(_) | RpcError::Aborted)
    }
}

/// Reply to a node state request.
#[derive(Debug, Clone, PartialEq)]
pub struct GetNodeStateReply {
    pub state: NodeState,
    /// Raw host info JSON, if the node sent any.
    pub host_info: Option<String>,
}

/// Reply to a version activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivateReply {
    /// Version the node actually activated.
    pub actual_version: u32,
}

/// Outbound RPCs to content nodes.
pub trait Communicator: Send + Sync {
    /// Ask for the node's state. The node may hold the request until its
    /// state differs from [`NodeInfo::reported_state`].
    fn get_node_state(&self, node: &NodeInfo, request_id: u64);

    /// Push a cluster state bundle to the node.
    fn set_cluster_state(&self, node: &NodeInfo, bundle: &ClusterStateBundle);

    /// Tell the node to activate a previously sent version.
    fn activate_cluster_state_version(&self, node: &NodeInfo, version: u32);
}
