use crate::cluster::Distribution;
use crate::state::{ClusterState, Node, State};
use std::collections::BTreeSet;

/// Finds leaf groups whose share of available storage nodes fell below the
/// configured ratio. Taking such a group out entirely avoids skewing data
/// onto its few remaining nodes.
#[derive(Debug, Clone, Copy)]
pub struct GroupAvailabilityCalculator<'a> {
    distribution: &'a Distribution,
    min_node_ratio_per_group: f64,
}

impl<'a> GroupAvailabilityCalculator<'a> {
    pub fn new(distribution: &'a Distribution, min_node_ratio_per_group: f64) -> Self {
        Self {
            distribution,
            min_node_ratio_per_group,
        }
    }

    /// Storage indices in groups below the availability threshold. Flat
    /// topologies and a zero threshold never take anything down.
    pub fn nodes_that_should_be_taken_down(&self, state: &ClusterState) -> BTreeSet<u16> {
        if self.min_node_ratio_per_group <= 0.0 || self.distribution.is_flat() {
            return BTreeSet::new();
        }

        let mut take_down = BTreeSet::new();
        for group in self.distribution.leaf_groups() {
            if group.nodes.is_empty() {
                continue;
            }
            let available = group
                .nodes
                .iter()
                .filter(|&&index| {
                    matches!(
                        state.node_state(Node::storage(index)).state(),
                        State::Up | State::Initializing | State::Retired | State::Maintenance
                    )
                })
                .count();
            let ratio = available as f64 / group.nodes.len() as f64;
            if ratio < self.min_node_ratio_per_group {
                take_down.extend(group.nodes.iter().copied());
            }
        }
        take_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Group;

    fn two_groups() -> Distribution {
        Distribution::hierarchical(vec![
            Group::leaf("g0", 0, [0, 1, 2]),
            Group::leaf("g1", 1, [3, 4, 5]),
        ])
    }

    #[test]
    fn test_group_below_ratio_is_taken_down() {
        let dist = two_groups();
        let state: ClusterState = "storage:6 .0.s:d .1.s:d".parse().unwrap();
        let calc = GroupAvailabilityCalculator::new(&dist, 0.67);
        assert_eq!(calc.nodes_that_should_be_taken_down(&state), BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn test_maintenance_counts_as_available() {
        let dist = two_groups();
        let state: ClusterState = "storage:6 .0.s:m .1.s:d".parse().unwrap();
        let calc = GroupAvailabilityCalculator::new(&dist, 0.6);
        assert!(calc.nodes_that_should_be_taken_down(&state).is_empty());
    }

    #[test]
    fn test_flat_topology_is_skipped() {
        let dist = Distribution::flat(0..3);
        let state: ClusterState = "storage:3 .0.s:d .1.s:d".parse().unwrap();
        let calc = GroupAvailabilityCalculator::new(&dist, 1.0);
        assert!(calc.nodes_that_should_be_taken_down(&state).is_empty());
    }
}
