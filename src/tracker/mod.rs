//! State version tracking.
//!
//! The [`StateVersionTracker`] turns a stream of candidate bundles from the
//! generator into a strictly increasing sequence of published versions:
//! - Holds the latest candidate and the current published bundle
//! - Decides whether a candidate differs enough to be worth publishing
//! - Stamps versions and keeps a bounded, newest-first history
//! - Ratchets the lowest distribution bit count ever published
//! - Owns the bucket space stats used to derive per-space states

mod deriver;

pub use deriver::ClusterStateDeriver;

use crate::cluster::HostInfo;
use crate::state::{ClusterStateBundle, DEFAULT_DISTRIBUTION_BITS};
use crate::stats::{
    ClusterStatsAggregator, ClusterStatsChangeTracker, ContentClusterStats, MergePendingChecker,
};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use tracing::debug;

/// Default number of published bundles kept in history.
pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 50;

/// One published bundle and when it was published.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStateHistoryEntry {
    bundle: ClusterStateBundle,
    time: u64,
}

impl ClusterStateHistoryEntry {
    pub fn bundle(&self) -> &ClusterStateBundle {
        &self.bundle
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn version(&self) -> u32 {
        self.bundle.version()
    }
}

impl fmt::Display for ClusterStateHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.time, self.bundle)
    }
}

#[derive(Debug, Clone)]
pub struct StateVersionTracker {
    current_version: u32,
    last_store_version: u32,
    current_unversioned: ClusterStateBundle,
    current_versioned: ClusterStateBundle,
    latest_candidate: ClusterStateBundle,
    history: VecDeque<ClusterStateHistoryEntry>,
    max_history_entries: usize,
    lowest_observed_distribution_bits: u32,
    bucket_spaces: Vec<String>,
    min_merge_completion_ratio: f64,
    aggregator: ClusterStatsAggregator,
    change_tracker: ClusterStatsChangeTracker,
}

impl StateVersionTracker {
    pub fn new(min_merge_completion_ratio: f64) -> Self {
        Self {
            current_version: 0,
            last_store_version: 0,
            current_unversioned: ClusterStateBundle::empty(),
            current_versioned: ClusterStateBundle::empty(),
            latest_candidate: ClusterStateBundle::empty(),
            history: VecDeque::new(),
            max_history_entries: DEFAULT_MAX_HISTORY_ENTRIES,
            lowest_observed_distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            bucket_spaces: Vec::new(),
            min_merge_completion_ratio,
            aggregator: ClusterStatsAggregator::default(),
            change_tracker: ClusterStatsChangeTracker::new(),
        }
    }

    pub fn set_max_history_entries(&mut self, max: usize) {
        self.max_history_entries = max;
        self.history.truncate(max);
    }

    pub fn set_min_merge_completion_ratio(&mut self, ratio: f64) {
        self.min_merge_completion_ratio = ratio;
    }

    pub fn set_bucket_spaces(&mut self, spaces: Vec<String>) {
        self.bucket_spaces = spaces;
    }

    pub fn bucket_spaces(&self) -> &[String] {
        &self.bucket_spaces
    }

    /// Apply cluster membership to the stats aggregator.
    pub fn set_node_sets(&mut self, distributors: BTreeSet<u16>, storage_nodes: BTreeSet<u16>) {
        self.aggregator.set_node_sets(distributors, storage_nodes);
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Resume from the version found in the coordination store. Versions
    /// never go below 1, so the first publish is at least 2.
    pub fn set_version_retrieved_from_store(&mut self, version: u32) {
        self.current_version = version.max(1);
        self.last_store_version = version;
    }

    pub fn set_cluster_state_bundle_retrieved_from_store(&mut self, bundle: &ClusterStateBundle) {
        self.current_unversioned = bundle.cloned_with_version(0);
    }

    /// True until we publish past what the store told us; forces the next
    /// candidate to be published even if it is similar.
    pub fn has_received_new_version_from_store(&self) -> bool {
        self.current_version <= self.last_store_version
    }

    pub fn lowest_observed_distribution_bits(&self) -> u32 {
        self.lowest_observed_distribution_bits
    }

    pub fn latest_candidate(&self) -> &ClusterStateBundle {
        &self.latest_candidate
    }

    /// The last published bundle, with its version.
    pub fn versioned_state(&self) -> &ClusterStateBundle {
        &self.current_versioned
    }

    /// Newest entry first.
    pub fn history(&self) -> &VecDeque<ClusterStateHistoryEntry> {
        &self.history
    }

    pub fn update_latest_candidate_state_bundle(&mut self, candidate: ClusterStateBundle) {
        debug_assert_eq!(candidate.version(), 0, "candidates must be unversioned");
        self.latest_candidate = candidate;
        self.change_tracker.update_snapshot(
            &self.aggregator,
            &self.bucket_spaces,
            self.min_merge_completion_ratio,
        );
    }

    pub fn candidate_changed_enough_from_current_to_warrant_publish(&self) -> bool {
        !self.current_unversioned.similar_to(&self.latest_candidate)
    }

    /// Publish the latest candidate as the next version.
    pub fn promote_candidate_to_versioned_state(&mut self, now: u64) -> &ClusterStateBundle {
        let new_version = self.current_version + 1;
        let versioned = self.latest_candidate.cloned_with_version(new_version);
        debug!(version = new_version, state = %versioned, "Promoting candidate cluster state");

        self.current_version = new_version;
        self.current_unversioned = self.latest_candidate.clone();
        self.lowest_observed_distribution_bits = self
            .lowest_observed_distribution_bits
            .min(versioned.baseline_state().distribution_bits());
        self.history.push_front(ClusterStateHistoryEntry {
            bundle: versioned.clone(),
            time: now,
        });
        self.history.truncate(self.max_history_entries);
        self.current_versioned = versioned;
        &self.current_versioned
    }

    /// Feed bucket space stats from a distributor's host info.
    pub fn handle_updated_host_info(&mut self, distributor: u16, host_info: &HostInfo) {
        if let Some(report) = &host_info.distributor {
            self.aggregator
                .update_for_distributor(distributor, ContentClusterStats::from_host_info(report));
        }
    }

    pub fn bucket_space_merge_completion_state_has_changed(&self) -> bool {
        self.change_tracker.has_changed(
            &self.aggregator,
            &self.bucket_spaces,
            self.min_merge_completion_ratio,
        )
    }

    pub fn aggregator(&self) -> &ClusterStatsAggregator {
        &self.aggregator
    }

    pub fn merge_pending_checker(&self) -> MergePendingChecker<'_> {
        self.aggregator
            .merge_pending_checker(self.min_merge_completion_ratio)
    }
}
