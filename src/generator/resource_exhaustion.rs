use crate::cluster::{HostInfo, NodeInfo, NodeRegistry};
use crate::state::{FeedBlock, NodeResourceExhaustion};
use std::collections::{BTreeMap, BTreeSet};

/// Exhaustions listed in a feed block description before eliding the rest.
const MAX_EXHAUSTIONS_DESCRIBED: usize = 3;

/// Decides whether feed must be blocked because storage nodes are running
/// out of resources.
///
/// A node already blocked on a resource stays blocked until its usage drops
/// below the limit minus the noise level.
#[derive(Debug, Clone, Copy)]
pub struct ResourceExhaustionCalculator<'a> {
    limits: &'a BTreeMap<String, f64>,
    noise_level: f64,
    previous: Option<&'a FeedBlock>,
}

impl<'a> ResourceExhaustionCalculator<'a> {
    pub fn new(
        limits: &'a BTreeMap<String, f64>,
        noise_level: f64,
        previous: Option<&'a FeedBlock>,
    ) -> Self {
        Self {
            limits,
            noise_level,
            previous,
        }
    }

    /// Exhaustions `info` would have if it reported `host_info`.
    pub fn exhaustions_for(&self, info: &NodeInfo, host_info: &HostInfo) -> Vec<NodeResourceExhaustion> {
        let node = info.node();
        host_info
            .resource_usage()
            .filter_map(|(resource, usage)| {
                let limit = *self.limits.get(resource)?;
                let already_blocked = self
                    .previous
                    .is_some_and(|block| block.has_exhaustion(node, resource));
                let effective_limit = if already_blocked {
                    limit - self.noise_level
                } else {
                    limit
                };
                (usage > effective_limit).then(|| NodeResourceExhaustion {
                    node,
                    resource: resource.to_string(),
                    usage,
                    limit,
                    address: info.rpc_address().unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    /// Whether applying `host_info` to `info` changes which resources the
    /// node is blocked on.
    pub fn exhaustion_set_changes(&self, info: &NodeInfo, host_info: &HostInfo) -> bool {
        let before: BTreeSet<String> = self
            .exhaustions_for(info, info.host_info())
            .into_iter()
            .map(|e| e.resource)
            .collect();
        let after: BTreeSet<String> = self
            .exhaustions_for(info, host_info)
            .into_iter()
            .map(|e| e.resource)
            .collect();
        before != after
    }

    pub fn infer_feed_block(&self, registry: &NodeRegistry) -> Option<FeedBlock> {
        let exhaustions: Vec<NodeResourceExhaustion> = registry
            .storage_nodes()
            .filter(|info| !info.reported_state().state().is_down_like())
            .flat_map(|info| self.exhaustions_for(info, info.host_info()))
            .collect();
        if exhaustions.is_empty() {
            return None;
        }

        let mut description = exhaustions
            .iter()
            .take(MAX_EXHAUSTIONS_DESCRIBED)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        if exhaustions.len() > MAX_EXHAUSTIONS_DESCRIBED {
            description.push_str(&format!(
                " (... and {} more)",
                exhaustions.len() - MAX_EXHAUSTIONS_DESCRIBED
            ));
        }
        Some(FeedBlock::blocked(description, exhaustions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ConfiguredNode, Distribution};
    use crate::state::{Node, NodeState, NodeType, State};

    fn usage(disk: f64) -> HostInfo {
        HostInfo::parse(&format!(
            r#"{{"content-node": {{"resource-usage": {{"disk": {{"usage": {}}}}}}}}}"#,
            disk
        ))
        .unwrap()
    }

    fn registry(disk: &[f64]) -> NodeRegistry {
        let nodes: Vec<_> = (0..disk.len() as u16).map(ConfiguredNode::new).collect();
        let mut reg = NodeRegistry::new("music", &nodes, Distribution::flat(0..disk.len() as u16));
        for (i, d) in disk.iter().enumerate() {
            let info = reg.get_mut(Node::storage(i as u16)).unwrap();
            info.set_rpc_address(format!("host{}", i));
            info.set_reported_state(NodeState::new(NodeType::Storage, State::Up), 0);
            info.set_host_info(usage(*d));
        }
        reg
    }

    fn limits() -> BTreeMap<String, f64> {
        BTreeMap::from([("disk".to_string(), 0.8)])
    }

    #[test]
    fn test_no_block_below_limits() {
        let limits = limits();
        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, None);
        assert!(calc.infer_feed_block(&registry(&[0.5, 0.79])).is_none());
    }

    #[test]
    fn test_block_lists_exhausted_nodes() {
        let limits = limits();
        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, None);
        let block = calc.infer_feed_block(&registry(&[0.85, 0.5])).unwrap();
        assert!(block.blocks_feed());
        assert_eq!(block.description(), "disk on node 0 [host0] (0.850 > 0.800)");
    }

    #[test]
    fn test_description_is_truncated() {
        let limits = limits();
        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, None);
        let block = calc
            .infer_feed_block(&registry(&[0.9, 0.9, 0.9, 0.9, 0.9]))
            .unwrap();
        assert!(block.description().ends_with("(... and 2 more)"));
        assert_eq!(block.exhaustions().len(), 5);
    }

    #[test]
    fn test_hysteresis_keeps_block_until_below_noise() {
        let limits = limits();
        let blocked = registry(&[0.85]);
        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, None);
        let previous = calc.infer_feed_block(&blocked).unwrap();

        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, Some(&previous));
        assert!(calc.infer_feed_block(&registry(&[0.795])).is_some());
        assert!(calc.infer_feed_block(&registry(&[0.785])).is_none());
    }

    #[test]
    fn test_down_nodes_are_ignored() {
        let limits = limits();
        let mut reg = registry(&[0.95]);
        reg.get_mut(Node::storage(0))
            .unwrap()
            .set_reported_state(NodeState::new(NodeType::Storage, State::Down), 1);
        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, None);
        assert!(calc.infer_feed_block(&reg).is_none());
    }

    #[test]
    fn test_exhaustion_set_change_detection() {
        let limits = limits();
        let reg = registry(&[0.5]);
        let info = reg.get(Node::storage(0)).unwrap();
        let calc = ResourceExhaustionCalculator::new(&limits, 0.01, None);
        assert!(calc.exhaustion_set_changes(info, &usage(0.9)));
        assert!(!calc.exhaustion_set_changes(info, &usage(0.6)));
    }
}
