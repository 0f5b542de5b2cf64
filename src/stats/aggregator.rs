use crate::cluster::DistributorHostInfo;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Bucket counts for one bucket space on one storage node.
///
/// Aggregates keep a count of invalid contributions instead of a flag, so
/// subtracting an invalid report makes the sum valid again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketSpaceStats {
    buckets_total: u64,
    buckets_pending: u64,
    invalid_contributions: u32,
}

impl BucketSpaceStats {
    pub fn of(total: u64, pending: u64) -> Self {
        Self {
            buckets_total: total,
            buckets_pending: pending,
            invalid_contributions: 0,
        }
    }

    /// Stats from a distributor that could not yet count the buckets.
    pub fn invalid() -> Self {
        Self {
            buckets_total: 0,
            buckets_pending: 0,
            invalid_contributions: 1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid_contributions == 0
    }

    pub fn buckets_total(&self) -> u64 {
        self.buckets_total
    }

    pub fn buckets_pending(&self) -> u64 {
        self.buckets_pending
    }

    pub fn add(&mut self, other: &BucketSpaceStats) {
        self.buckets_total += other.buckets_total;
        self.buckets_pending += other.buckets_pending;
        self.invalid_contributions += other.invalid_contributions;
    }

    pub fn subtract(&mut self, other: &BucketSpaceStats) {
        self.buckets_total = self.buckets_total.saturating_sub(other.buckets_total);
        self.buckets_pending = self.buckets_pending.saturating_sub(other.buckets_pending);
        self.invalid_contributions = self
            .invalid_contributions
            .saturating_sub(other.invalid_contributions);
    }

    /// Fraction of buckets not pending; 1.0 for an empty space.
    pub fn merge_completion_ratio(&self) -> f64 {
        if self.buckets_total == 0 {
            return 1.0;
        }
        1.0 - (self.buckets_pending as f64 / self.buckets_total as f64)
    }

    pub fn may_have_buckets_pending(&self, min_merge_completion_ratio: f64) -> bool {
        !self.is_valid() || self.merge_completion_ratio() < min_merge_completion_ratio
    }
}

/// Per bucket space stats for one storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentNodeStats {
    bucket_spaces: BTreeMap<String, BucketSpaceStats>,
}

impl ContentNodeStats {
    pub fn bucket_space(&self, space: &str) -> Option<&BucketSpaceStats> {
        self.bucket_spaces.get(space)
    }

    pub fn bucket_spaces(&self) -> &BTreeMap<String, BucketSpaceStats> {
        &self.bucket_spaces
    }

    pub fn set_bucket_space(&mut self, space: impl Into<String>, stats: BucketSpaceStats) {
        self.bucket_spaces.insert(space.into(), stats);
    }

    pub fn add(&mut self, other: &ContentNodeStats) {
        for (space, stats) in &other.bucket_spaces {
            self.bucket_spaces.entry(space.clone()).or_default().add(stats);
        }
    }

    pub fn subtract(&mut self, other: &ContentNodeStats) {
        for (space, stats) in &other.bucket_spaces {
            if let Some(ours) = self.bucket_spaces.get_mut(space) {
                ours.subtract(stats);
            }
        }
    }
}

/// Stats for every storage node, as seen by one distributor or summed over
/// all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentClusterStats {
    nodes: BTreeMap<u16, ContentNodeStats>,
}

impl ContentClusterStats {
    pub fn from_host_info(info: &DistributorHostInfo) -> Self {
        let nodes = info
            .storage_nodes
            .iter()
            .map(|report| {
                let mut stats = ContentNodeStats::default();
                for space in &report.bucket_spaces {
                    let space_stats = match space.buckets {
                        Some(counts) => BucketSpaceStats::of(counts.total, counts.pending),
                        None => BucketSpaceStats::invalid(),
                    };
                    stats.set_bucket_space(space.name.clone(), space_stats);
                }
                (report.node_index, stats)
            })
            .collect();
        Self { nodes }
    }

    pub fn node(&self, index: u16) -> Option<&ContentNodeStats> {
        self.nodes.get(&index)
    }

    pub fn nodes(&self) -> &BTreeMap<u16, ContentNodeStats> {
        &self.nodes
    }

    pub fn set_node(&mut self, index: u16, stats: ContentNodeStats) {
        self.nodes.insert(index, stats);
    }
}

/// Sums the latest report from every distributor.
#[derive(Debug, Clone, Default)]
pub struct ClusterStatsAggregator {
    distributors: BTreeSet<u16>,
    storage_nodes: BTreeSet<u16>,
    non_updated_distributors: BTreeSet<u16>,
    per_distributor: BTreeMap<u16, ContentClusterStats>,
    aggregated: ContentClusterStats,
}

impl ClusterStatsAggregator {
    pub fn new(distributors: BTreeSet<u16>, storage_nodes: BTreeSet<u16>) -> Self {
        let mut aggregator = Self::default();
        aggregator.set_node_sets(distributors, storage_nodes);
        aggregator
    }

    /// Apply a new membership. Reports from distributors that left are
    /// dropped and the aggregate is rebuilt from the remaining ones.
    pub fn set_node_sets(&mut self, distributors: BTreeSet<u16>, storage_nodes: BTreeSet<u16>) {
        self.per_distributor
            .retain(|index, _| distributors.contains(index));
        self.non_updated_distributors = distributors
            .iter()
            .filter(|index| !self.per_distributor.contains_key(*index))
            .copied()
            .collect();
        self.distributors = distributors;
        self.storage_nodes = storage_nodes;

        self.aggregated = ContentClusterStats::default();
        let reports: Vec<ContentClusterStats> = self.per_distributor.values().cloned().collect();
        for report in &reports {
            self.add_report(report);
        }
    }

    pub fn update_for_distributor(&mut self, distributor: u16, stats: ContentClusterStats) {
        if !self.distributors.contains(&distributor) {
            debug!(distributor, "Ignoring stats from unconfigured distributor");
            return;
        }
        if let Some(previous) = self.per_distributor.remove(&distributor) {
            self.subtract_report(&previous);
        }
        self.add_report(&stats);
        self.per_distributor.insert(distributor, stats);
        self.non_updated_distributors.remove(&distributor);
    }

    fn add_report(&mut self, report: &ContentClusterStats) {
        for (index, stats) in report.nodes() {
            if self.storage_nodes.contains(index) {
                self.aggregated.nodes.entry(*index).or_default().add(stats);
            }
        }
    }

    fn subtract_report(&mut self, report: &ContentClusterStats) {
        for (index, stats) in report.nodes() {
            if let Some(ours) = self.aggregated.nodes.get_mut(index) {
                ours.subtract(stats);
            }
        }
    }

    pub fn has_updates_from_all_distributors(&self) -> bool {
        self.non_updated_distributors.is_empty()
    }

    pub fn aggregated(&self) -> &ContentClusterStats {
        &self.aggregated
    }

    pub fn storage_nodes(&self) -> &BTreeSet<u16> {
        &self.storage_nodes
    }

    pub fn merge_pending_checker(&self, min_merge_completion_ratio: f64) -> MergePendingChecker<'_> {
        MergePendingChecker {
            aggregator: self,
            min_merge_completion_ratio,
        }
    }
}

/// Answers whether a storage node may still have merges pending in a
/// bucket space.
#[derive(Debug, Clone, Copy)]
pub struct MergePendingChecker<'a> {
    aggregator: &'a ClusterStatsAggregator,
    min_merge_completion_ratio: f64,
}

impl MergePendingChecker<'_> {
    /// Pending unless every distributor has reported and the aggregate
    /// says the node is done. A node no distributor mentions has nothing
    /// to merge; a known node without the space is assumed pending.
    pub fn may_have_merges_pending(&self, space: &str, storage_index: u16) -> bool {
        if !self.aggregator.has_updates_from_all_distributors() {
            return true;
        }
        match self.aggregator.aggregated().node(storage_index) {
            None => false,
            Some(stats) => match stats.bucket_space(space) {
                None => true,
                Some(space_stats) => {
                    space_stats.may_have_buckets_pending(self.min_merge_completion_ratio)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(entries: &[(u16, &str, Option<(u64, u64)>)]) -> ContentClusterStats {
        let mut stats = ContentClusterStats::default();
        for (index, space, counts) in entries {
            let mut node = stats.node(*index).cloned().unwrap_or_default();
            let space_stats = match counts {
                Some((total, pending)) => BucketSpaceStats::of(*total, *pending),
                None => BucketSpaceStats::invalid(),
            };
            node.set_bucket_space(*space, space_stats);
            stats.set_node(*index, node);
        }
        stats
    }

    fn aggregator() -> ClusterStatsAggregator {
        ClusterStatsAggregator::new(BTreeSet::from([0, 1]), BTreeSet::from([0, 1]))
    }

    #[test]
    fn test_pending_until_all_distributors_reported() {
        let mut agg = aggregator();
        agg.update_for_distributor(0, report(&[(0, "global", Some((10, 0)))]));
        let checker = agg.merge_pending_checker(1.0);
        assert!(!agg.has_updates_from_all_distributors());
        assert!(checker.may_have_merges_pending("global", 0));
    }

    #[test]
    fn test_reports_are_summed() {
        let mut agg = aggregator();
        agg.update_for_distributor(0, report(&[(0, "global", Some((10, 2)))]));
        agg.update_for_distributor(1, report(&[(0, "global", Some((5, 1)))]));
        let stats = agg.aggregated().node(0).unwrap().bucket_space("global").unwrap();
        assert_eq!(stats.buckets_total(), 15);
        assert_eq!(stats.buckets_pending(), 3);
        assert!(agg.merge_pending_checker(1.0).may_have_merges_pending("global", 0));
        assert!(!agg.merge_pending_checker(0.5).may_have_merges_pending("global", 0));
    }

    #[test]
    fn test_new_report_replaces_previous_contribution() {
        let mut agg = aggregator();
        agg.update_for_distributor(0, report(&[(0, "global", Some((10, 4)))]));
        agg.update_for_distributor(1, report(&[(0, "global", Some((10, 0)))]));
        agg.update_for_distributor(0, report(&[(0, "global", Some((10, 0)))]));
        let stats = agg.aggregated().node(0).unwrap().bucket_space("global").unwrap();
        assert_eq!(stats.buckets_total(), 20);
        assert_eq!(stats.buckets_pending(), 0);
        assert!(!agg.merge_pending_checker(1.0).may_have_merges_pending("global", 0));
    }

    #[test]
    fn test_invalid_report_marks_pending_until_replaced() {
        let mut agg = aggregator();
        agg.update_for_distributor(0, report(&[(1, "global", None)]));
        agg.update_for_distributor(1, report(&[(1, "global", Some((3, 0)))]));
        assert!(agg.merge_pending_checker(1.0).may_have_merges_pending("global", 1));

        agg.update_for_distributor(0, report(&[(1, "global", Some((3, 0)))]));
        assert!(!agg.merge_pending_checker(1.0).may_have_merges_pending("global", 1));
    }

    #[test]
    fn test_unknown_node_and_space() {
        let mut agg = aggregator();
        agg.update_for_distributor(0, report(&[(0, "default", Some((1, 0)))]));
        agg.update_for_distributor(1, report(&[]));
        let checker = agg.merge_pending_checker(1.0);
        assert!(!checker.may_have_merges_pending("global", 1));
        assert!(checker.may_have_merges_pending("global", 0));
    }

    #[test]
    fn test_removed_distributor_cascades() {
        let mut agg = aggregator();
        agg.update_for_distributor(0, report(&[(0, "global", Some((10, 5)))]));
        agg.update_for_distributor(1, report(&[(0, "global", Some((10, 0)))]));
        agg.set_node_sets(BTreeSet::from([1]), BTreeSet::from([0, 1]));
        assert!(agg.has_updates_from_all_distributors());
        let stats = agg.aggregated().node(0).unwrap().bucket_space("global").unwrap();
        assert_eq!(stats.buckets_pending(), 0);

        agg.update_for_distributor(0, report(&[(0, "global", Some((99, 99)))]));
        let stats = agg.aggregated().node(0).unwrap().bucket_space("global").unwrap();
        assert_eq!(stats.buckets_total(), 10);
    }
}
