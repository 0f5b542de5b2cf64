//! Coordination store access.
//!
//! The [`Database`] trait is the store the replicas share: master votes,
//! the latest published version and bundle, operator wanted states and
//! observed start timestamps. [`DatabaseHandler`] sits between it and the
//! control loop:
//! - writes are queued and retried every tick until they succeed,
//! - cluster state metadata is only written while this replica is master,
//! - a lost connection resets the election.

mod memory;

pub use memory::MemoryDatabase;

use crate::election::{MasterElectionHandler, Votes};
use crate::error::{ControllerError, Result};
use crate::events::{EventLog, EventType};
use crate::observability;
use crate::state::{ClusterStateBundle, Node, NodeState};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coordination store shared by all controller replicas.
#[async_trait]
pub trait Database: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Votes of every replica with a live session.
    async fn master_votes(&self) -> Result<Votes>;

    async fn store_master_vote(&self, voter: u32, vote: u32) -> Result<()>;

    async fn latest_version(&self) -> Result<u32>;

    async fn store_latest_version(&self, version: u32) -> Result<()>;

    async fn state_bundle(&self) -> Result<Option<ClusterStateBundle>>;

    async fn store_state_bundle(&self, bundle: &ClusterStateBundle) -> Result<()>;

    async fn wanted_states(&self) -> Result<BTreeMap<Node, NodeState>>;

    async fn store_wanted_states(&self, states: &BTreeMap<Node, NodeState>) -> Result<()>;

    async fn start_timestamps(&self) -> Result<BTreeMap<Node, u64>>;

    async fn store_start_timestamps(&self, timestamps: &BTreeMap<Node, u64>) -> Result<()>;
}

/// Everything a new master restores from the store.
#[derive(Debug, Clone, Default)]
pub struct MasterMetadata {
    pub latest_version: u32,
    pub state_bundle: Option<ClusterStateBundle>,
    pub wanted_states: BTreeMap<Node, NodeState>,
    pub start_timestamps: BTreeMap<Node, u64>,
}

#[derive(Debug, Clone, Default)]
struct PendingStore {
    master_vote: Option<u32>,
    latest_version: Option<u32>,
    state_bundle: Option<ClusterStateBundle>,
    wanted_states: Option<BTreeMap<Node, NodeState>>,
    start_timestamps: Option<BTreeMap<Node, u64>>,
}

impl PendingStore {
    fn has_metadata(&self) -> bool {
        self.latest_version.is_some()
            || self.state_bundle.is_some()
            || self.wanted_states.is_some()
            || self.start_timestamps.is_some()
    }

    fn clear_metadata(&mut self) {
        self.latest_version = None;
        self.state_bundle = None;
        self.wanted_states = None;
        self.start_timestamps = None;
    }
}

pub struct DatabaseHandler {
    database: Arc<dyn Database>,
    index: u32,
    connected: bool,
    last_vote: Option<u32>,
    pending: PendingStore,
    stored_version: u32,
    wanted_states_stored: bool,
}

impl DatabaseHandler {
    pub fn new(database: Arc<dyn Database>, index: u32) -> Self {
        Self {
            database,
            index,
            connected: false,
            last_vote: None,
            pending: PendingStore::default(),
            stored_version: 0,
            wanted_states_stored: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Last cluster state version this replica wrote to the store since it
    /// last became master. Versions read from the store do not count: the
    /// store may hold a different bundle under a number we also used.
    pub fn stored_version(&self) -> u32 {
        self.stored_version
    }

    /// Whether a cluster state version or bundle still waits to be stored.
    /// Nothing may be broadcast while this holds.
    pub fn has_pending_cluster_state_metadata_store(&self) -> bool {
        self.pending.latest_version.is_some() || self.pending.state_bundle.is_some()
    }

    pub fn set_master_vote(&mut self, vote: u32) {
        self.last_vote = Some(vote);
        self.pending.master_vote = Some(vote);
    }

    pub fn save_latest_version(&mut self, version: u32) {
        self.pending.latest_version = Some(version);
    }

    pub fn save_state_bundle(&mut self, bundle: ClusterStateBundle) {
        self.pending.state_bundle = Some(bundle);
    }

    pub fn save_wanted_states(&mut self, states: BTreeMap<Node, NodeState>) {
        self.pending.wanted_states = Some(states);
        self.wanted_states_stored = false;
    }

    /// Whether the last queued wanted states reached the store. Reading
    /// clears the answer.
    pub fn take_wanted_states_stored(&mut self) -> bool {
        std::mem::take(&mut self.wanted_states_stored)
    }

    pub fn save_start_timestamps(&mut self, timestamps: BTreeMap<Node, u64>) {
        self.pending.start_timestamps = Some(timestamps);
    }

    /// Check the connection, flush queued writes and read the votes.
    /// Returns whether anything happened.
    pub async fn do_next_task(
        &mut self,
        election: &mut MasterElectionHandler,
        events: &mut EventLog,
        is_master: bool,
        now: u64,
    ) -> bool {
        if !self.database.is_connected().await {
            if self.connected {
                warn!(index = self.index, "lost connection to coordination store");
                events.add_cluster_event(EventType::Cluster, "Lost connection to coordination store", now);
                election.lost_database_connection(now);
                observability::record_store_failure();
                self.connected = false;
                return true;
            }
            return false;
        }

        let mut did_work = false;
        if !self.connected {
            info!(index = self.index, "connected to coordination store");
            events.add_cluster_event(EventType::Cluster, "Connected to coordination store", now);
            self.connected = true;
            self.pending.master_vote = Some(self.last_vote.unwrap_or(self.index));
            did_work = true;
        }

        did_work |= self.flush(is_master).await;

        match self.database.master_votes().await {
            Ok(votes) => election.handle_vote_data(votes),
            Err(e) => self.store_failed("read master votes", &e),
        }
        did_work
    }

    /// Write everything queued. Cluster state metadata is dropped rather
    /// than written when this replica is not master. Returns whether
    /// anything was written.
    pub async fn flush(&mut self, is_master: bool) -> bool {
        if !self.connected {
            return false;
        }
        let mut did_work = false;

        if let Some(vote) = self.pending.master_vote {
            match self.database.store_master_vote(self.index, vote).await {
                Ok(()) => {
                    debug!(index = self.index, vote, "stored master vote");
                    self.pending.master_vote = None;
                    did_work = true;
                }
                Err(e) => self.store_failed("store master vote", &e),
            }
        }

        if !is_master {
            if self.pending.has_metadata() {
                debug!(index = self.index, "not master, discarding cluster state metadata writes");
                self.pending.clear_metadata();
            }
            return did_work;
        }

        if let Some(version) = self.pending.latest_version {
            match self.database.store_latest_version(version).await {
                Ok(()) => {
                    debug!(version, "stored latest cluster state version");
                    self.pending.latest_version = None;
                    self.stored_version = version;
                    did_work = true;
                }
                Err(e) => self.store_failed("store latest version", &e),
            }
        }
        // The bundle must not overtake its version.
        if self.pending.latest_version.is_none() {
            if let Some(bundle) = self.pending.state_bundle.take() {
                match self.database.store_state_bundle(&bundle).await {
                    Ok(()) => did_work = true,
                    Err(e) => {
                        self.store_failed("store state bundle", &e);
                        self.pending.state_bundle = Some(bundle);
                    }
                }
            }
        }
        if let Some(states) = self.pending.wanted_states.take() {
            match self.database.store_wanted_states(&states).await {
                Ok(()) => {
                    self.wanted_states_stored = true;
                    did_work = true;
                }
                Err(e) => {
                    self.store_failed("store wanted states", &e);
                    self.pending.wanted_states = Some(states);
                }
            }
        }
        if let Some(timestamps) = self.pending.start_timestamps.take() {
            match self.database.store_start_timestamps(&timestamps).await {
                Ok(()) => did_work = true,
                Err(e) => {
                    self.store_failed("store start timestamps", &e);
                    self.pending.start_timestamps = Some(timestamps);
                }
            }
        }
        did_work
    }

    /// Read what a newly elected master needs to continue where the
    /// previous one stopped.
    pub async fn load_master_metadata(&mut self) -> Result<MasterMetadata> {
        if !self.connected {
            return Err(ControllerError::StoreUnavailable(
                "not connected to coordination store".to_string(),
            ));
        }
        let metadata = MasterMetadata {
            latest_version: self.database.latest_version().await?,
            state_bundle: self.database.state_bundle().await?,
            wanted_states: self.database.wanted_states().await?,
            start_timestamps: self.database.start_timestamps().await?,
        };
        self.stored_version = 0;
        info!(
            version = metadata.latest_version,
            wanted_states = metadata.wanted_states.len(),
            "loaded cluster state metadata from coordination store"
        );
        Ok(metadata)
    }

    fn store_failed(&self, operation: &str, error: &ControllerError) {
        warn!(index = self.index, error = %error, "failed to {}", operation);
        observability::record_store_failure();
    }
}
