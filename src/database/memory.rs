use super::Database;
use crate::election::Votes;
use crate::error::{ControllerError, Result};
use crate::state::{ClusterStateBundle, Node, NodeState};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryDatabaseState {
    disconnected: bool,
    reject_writes: bool,
    votes: Votes,
    latest_version: u32,
    state_bundle: Option<ClusterStateBundle>,
    wanted_states: BTreeMap<Node, NodeState>,
    start_timestamps: BTreeMap<Node, u64>,
}

/// In-process coordination store.
///
/// Clones share state, so several controller replicas in one process (or a
/// test and the controller under test) see the same data. Connection loss
/// and rejected writes can be simulated.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryDatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().disconnected = !connected;
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.state.lock().reject_writes = reject;
    }

    /// Drop a replica's vote, as when its session expires.
    pub fn remove_vote(&self, index: u32) {
        self.state.lock().votes.remove(&index);
    }

    pub fn stored_votes(&self) -> Votes {
        self.state.lock().votes.clone()
    }

    pub fn stored_latest_version(&self) -> u32 {
        self.state.lock().latest_version
    }

    pub fn stored_state_bundle(&self) -> Option<ClusterStateBundle> {
        self.state.lock().state_bundle.clone()
    }

    pub fn stored_wanted_states(&self) -> BTreeMap<Node, NodeState> {
        self.state.lock().wanted_states.clone()
    }

    pub fn stored_start_timestamps(&self) -> BTreeMap<Node, u64> {
        self.state.lock().start_timestamps.clone()
    }

    fn connected(&self) -> Result<MutexGuard<'_, MemoryDatabaseState>> {
        let state = self.state.lock();
        if state.disconnected {
            return Err(ControllerError::StoreUnavailable("not connected".to_string()));
        }
        Ok(state)
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryDatabaseState>> {
        let state = self.connected()?;
        if state.reject_writes {
            return Err(ControllerError::StoreWriteRejected("writes are rejected".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn is_connected(&self) -> bool {
        !self.state.lock().disconnected
    }

    async fn master_votes(&self) -> Result<Votes> {
        Ok(self.connected()?.votes.clone())
    }

    async fn store_master_vote(&self, voter: u32, vote: u32) -> Result<()> {
        self.writable()?.votes.insert(voter, vote);
        Ok(())
    }

    async fn latest_version(&self) -> Result<u32> {
        Ok(self.connected()?.latest_version)
    }

    async fn store_latest_version(&self, version: u32) -> Result<()> {
        self.writable()?.latest_version = version;
        Ok(())
    }

    async fn state_bundle(&self) -> Result<Option<ClusterStateBundle>> {
        Ok(self.connected()?.state_bundle.clone())
    }

    async fn store_state_bundle(&self, bundle: &ClusterStateBundle) -> Result<()> {
        self.writable()?.state_bundle = Some(bundle.clone());
        Ok(())
    }

    async fn wanted_states(&self) -> Result<BTreeMap<Node, NodeState>> {
        Ok(self.connected()?.wanted_states.clone())
    }

    async fn store_wanted_states(&self, states: &BTreeMap<Node, NodeState>) -> Result<()> {
        self.writable()?.wanted_states = states.clone();
        Ok(())
    }

    async fn start_timestamps(&self) -> Result<BTreeMap<Node, u64>> {
        Ok(self.connected()?.start_timestamps.clone())
    }

    async fn store_start_timestamps(&self, timestamps: &BTreeMap<Node, u64>) -> Result<()> {
        self.writable()?.start_timestamps = timestamps.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let db = MemoryDatabase::new();
        let other = db.clone();
        db.store_latest_version(7).await.unwrap();
        assert_eq!(other.latest_version().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_disconnected_store_fails() {
        let db = MemoryDatabase::new();
        db.set_connected(false);
        assert!(!db.is_connected().await);
        let err = db.master_votes().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejected_writes_leave_reads_working() {
        let db = MemoryDatabase::new();
        db.store_master_vote(0, 0).await.unwrap();
        db.set_reject_writes(true);
        assert!(matches!(
            db.store_master_vote(1, 0).await,
            Err(ControllerError::StoreWriteRejected(_))
        ));
        assert_eq!(db.master_votes().await.unwrap().len(), 1);
        db.remove_vote(0);
        assert!(db.stored_votes().is_empty());
    }
}
