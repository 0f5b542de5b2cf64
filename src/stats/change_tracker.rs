use super::aggregator::ClusterStatsAggregator;
use std::collections::BTreeMap;

/// Remembers which storage nodes may have had merges pending when the last
/// candidate state was computed, so a change in that answer can trigger a
/// recomputation.
#[derive(Debug, Clone, Default)]
pub struct ClusterStatsChangeTracker {
    snapshot: BTreeMap<(String, u16), bool>,
}

impl ClusterStatsChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(
        aggregator: &ClusterStatsAggregator,
        spaces: &[String],
        min_merge_completion_ratio: f64,
    ) -> BTreeMap<(String, u16), bool> {
        let checker = aggregator.merge_pending_checker(min_merge_completion_ratio);
        let mut current = BTreeMap::new();
        for space in spaces {
            for &index in aggregator.storage_nodes() {
                current.insert(
                    (space.clone(), index),
                    checker.may_have_merges_pending(space, index),
                );
            }
        }
        current
    }

    pub fn update_snapshot(
        &mut self,
        aggregator: &ClusterStatsAggregator,
        spaces: &[String],
        min_merge_completion_ratio: f64,
    ) {
        self.snapshot = Self::current(aggregator, spaces, min_merge_completion_ratio);
    }

    /// Whether the merge-pending answer changed for any node since the
    /// last snapshot. Partial reports never count as a change.
    pub fn has_changed(
        &self,
        aggregator: &ClusterStatsAggregator,
        spaces: &[String],
        min_merge_completion_ratio: f64,
    ) -> bool {
        if !aggregator.has_updates_from_all_distributors() {
            return false;
        }
        Self::current(aggregator, spaces, min_merge_completion_ratio) != self.snapshot
    }
}
