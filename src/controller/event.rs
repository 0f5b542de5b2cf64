use crate::clock::{Clock, SystemClock};
use crate::cluster::NodeLookup;
use crate::communicator::{ActivateReply, Communicator, GetNodeStateReply, RpcError};
use crate::config::ControllerConfig;
use crate::database::Database;
use crate::state::Node;
use crate::tasks::RemoteTask;
use std::sync::Arc;

/// Everything that reaches the control loop from other tasks.
#[derive(Debug)]
pub enum ControllerEvent {
    NodeStateReply {
        node: Node,
        request_id: u64,
        result: Result<GetNodeStateReply, RpcError>,
    },
    SetClusterStateReply {
        node: Node,
        version: u32,
        result: Result<(), RpcError>,
    },
    ActivateReply {
        node: Node,
        version: u32,
        result: Result<ActivateReply, RpcError>,
    },
    RemoteTask(Box<dyn RemoteTask>),
    /// Applied at the end of the tick it is drained in.
    Reconfigure(Box<ControllerConfig>),
}

/// External collaborators of a controller.
pub struct ControllerServices {
    pub database: Arc<dyn Database>,
    pub communicator: Arc<dyn Communicator>,
    pub lookup: Box<dyn NodeLookup>,
    pub clock: Arc<dyn Clock>,
}

impl ControllerServices {
    pub fn new(
        database: Arc<dyn Database>,
        communicator: Arc<dyn Communicator>,
        lookup: Box<dyn NodeLookup>,
    ) -> Self {
        Self {
            database,
            communicator,
            lookup,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Bookkeeping carried from one tick to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlLoopState {
    pub cycle_count: u64,
    pub was_master: bool,
    /// When this replica last became master.
    pub became_master_at: u64,
    /// Whether the store's version and wanted states have been read since
    /// becoming master. Nothing is published before they are.
    pub metadata_loaded: bool,
    pub published_as_master: bool,
    pub last_state_broadcast: u64,
    pub is_state_gatherer: bool,
}
