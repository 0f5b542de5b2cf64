//! State bundles: a baseline cluster state plus per-bucket-space variants.

use super::annotated::AnnotatedClusterState;
use super::cluster_state::ClusterState;
use super::node::Node;
use crate::tracker::ClusterStateDeriver;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One node running out of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResourceExhaustion {
    pub node: Node,
    pub resource: String,
    pub usage: f64,
    pub limit: f64,
    pub address: String,
}

impl NodeResourceExhaustion {
    fn key(&self) -> (Node, &str) {
        (self.node, self.resource.as_str())
    }
}

impl fmt::Display for NodeResourceExhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on node {} [{}] ({:.3} > {:.3})",
            self.resource,
            self.node.index(),
            if self.address.is_empty() { "unknown" } else { self.address.as_str() },
            self.usage,
            self.limit
        )
    }
}

/// Cluster-wide feed block derived from resource exhaustion.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBlock {
    block_feed: bool,
    description: String,
    exhaustions: Vec<NodeResourceExhaustion>,
}

impl FeedBlock {
    pub fn blocked(description: impl Into<String>, exhaustions: Vec<NodeResourceExhaustion>) -> Self {
        Self {
            block_feed: true,
            description: description.into(),
            exhaustions,
        }
    }

    pub fn blocks_feed(&self) -> bool {
        self.block_feed
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn exhaustions(&self) -> &[NodeResourceExhaustion] {
        &self.exhaustions
    }

    /// Whether `node` was blocked on `resource`.
    pub fn has_exhaustion(&self, node: Node, resource: &str) -> bool {
        self.exhaustions
            .iter()
            .any(|e| e.node == node && e.resource == resource)
    }

    /// Same blocking decision over the same `(node, resource)` set. Usage
    /// values are ignored.
    pub fn similar_to(&self, other: &FeedBlock) -> bool {
        let ours: BTreeSet<_> = self.exhaustions.iter().map(|e| e.key()).collect();
        let theirs: BTreeSet<_> = other.exhaustions.iter().map(|e| e.key()).collect();
        self.block_feed == other.block_feed && ours == theirs
    }
}

/// A baseline state plus one derived state per bucket space.
///
/// Once versioned, every derived state carries the baseline's version.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStateBundle {
    baseline: AnnotatedClusterState,
    derived: BTreeMap<String, AnnotatedClusterState>,
    feed_block: Option<FeedBlock>,
    deferred_activation: bool,
}

impl ClusterStateBundle {
    pub fn empty() -> Self {
        Self::of_baseline_only(AnnotatedClusterState::empty())
    }

    pub fn of_baseline_only(baseline: AnnotatedClusterState) -> Self {
        Self {
            baseline,
            derived: BTreeMap::new(),
            feed_block: None,
            deferred_activation: false,
        }
    }

    pub fn builder(baseline: AnnotatedClusterState) -> ClusterStateBundleBuilder {
        ClusterStateBundleBuilder {
            baseline,
            bucket_spaces: Vec::new(),
            deriver: ClusterStateDeriver::Identity,
            feed_block: None,
            deferred_activation: false,
        }
    }

    pub fn baseline(&self) -> &AnnotatedClusterState {
        &self.baseline
    }

    pub fn baseline_state(&self) -> &ClusterState {
        self.baseline.cluster_state()
    }

    pub fn derived(&self) -> &BTreeMap<String, AnnotatedClusterState> {
        &self.derived
    }

    pub fn derived_state(&self, space: &str) -> Option<&AnnotatedClusterState> {
        self.derived.get(space)
    }

    pub fn feed_block(&self) -> Option<&FeedBlock> {
        self.feed_block.as_ref()
    }

    pub fn cluster_feed_is_blocked(&self) -> bool {
        self.feed_block.as_ref().is_some_and(FeedBlock::blocks_feed)
    }

    pub fn deferred_activation(&self) -> bool {
        self.deferred_activation
    }

    pub fn version(&self) -> u32 {
        self.baseline.version()
    }

    /// Copy with the baseline and all derived states stamped with `version`.
    pub fn cloned_with_version(&self, version: u32) -> Self {
        Self {
            baseline: self.baseline.cloned_with_version(version),
            derived: self
                .derived
                .iter()
                .map(|(space, state)| (space.clone(), state.cloned_with_version(version)))
                .collect(),
            feed_block: self.feed_block.clone(),
            deferred_activation: self.deferred_activation,
        }
    }

    /// Copy with `f` applied to the baseline and every derived state.
    pub fn map_states(&self, f: impl Fn(&ClusterState) -> ClusterState) -> Self {
        Self {
            baseline: self.baseline.map_state(&f),
            derived: self
                .derived
                .iter()
                .map(|(space, state)| (space.clone(), state.map_state(&f)))
                .collect(),
            feed_block: self.feed_block.clone(),
            deferred_activation: self.deferred_activation,
        }
    }

    /// Publish hysteresis: init progress and version are ignored.
    pub fn similar_to(&self, other: &ClusterStateBundle) -> bool {
        if !self.baseline.similar_to_ignoring_init_progress(&other.baseline) {
            return false;
        }
        if self.cluster_feed_is_blocked() != other.cluster_feed_is_blocked() {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (&self.feed_block, &other.feed_block) {
            if !ours.similar_to(theirs) {
                return false;
            }
        }
        if self.deferred_activation != other.deferred_activation {
            return false;
        }
        if self.derived.len() != other.derived.len() {
            return false;
        }
        self.derived.iter().all(|(space, state)| {
            other
                .derived
                .get(space)
                .is_some_and(|o| state.similar_to_ignoring_init_progress(o))
        })
    }
}

impl fmt::Display for ClusterStateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.baseline.cluster_state())?;
        for (space, state) in &self.derived {
            if state.cluster_state() != self.baseline.cluster_state() {
                write!(f, ", {}: {}", space, state.cluster_state())?;
            }
        }
        if let Some(block) = self.feed_block.as_ref().filter(|b| b.blocks_feed()) {
            write!(f, ", feed blocked: '{}'", block.description())?;
        }
        Ok(())
    }
}

/// Builds a bundle by running the deriver once per bucket space.
#[derive(Debug, Clone)]
pub struct ClusterStateBundleBuilder {
    baseline: AnnotatedClusterState,
    bucket_spaces: Vec<String>,
    deriver: ClusterStateDeriver,
    feed_block: Option<FeedBlock>,
    deferred_activation: bool,
}

impl ClusterStateBundleBuilder {
    pub fn bucket_spaces<I, S>(mut self, spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bucket_spaces = spaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn deriver(mut self, deriver: ClusterStateDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn feed_block(mut self, feed_block: Option<FeedBlock>) -> Self {
        self.feed_block = feed_block;
        self
    }

    pub fn deferred_activation(mut self, deferred: bool) -> Self {
        self.deferred_activation = deferred;
        self
    }

    pub fn derive_and_build(self) -> ClusterStateBundle {
        let derived = self
            .bucket_spaces
            .iter()
            .map(|space| (space.clone(), self.deriver.derive(&self.baseline, space)))
            .collect();
        ClusterStateBundle {
            baseline: self.baseline,
            derived,
            feed_block: self.feed_block,
            deferred_activation: self.deferred_activation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated(s: &str) -> AnnotatedClusterState {
        AnnotatedClusterState::with_state(s.parse().unwrap())
    }

    fn bundle(s: &str) -> ClusterStateBundle {
        ClusterStateBundle::builder(annotated(s))
            .bucket_spaces(["default", "global"])
            .derive_and_build()
    }

    fn exhaustion(index: u16, resource: &str, usage: f64) -> NodeResourceExhaustion {
        NodeResourceExhaustion {
            node: Node::storage(index),
            resource: resource.to_string(),
            usage,
            limit: 0.8,
            address: format!("storage/{}", index),
        }
    }

    #[test]
    fn test_version_is_stamped_on_all_states() {
        let versioned = bundle("distributor:2 storage:2").cloned_with_version(7);
        assert_eq!(versioned.version(), 7);
        assert!(versioned.derived().values().all(|s| s.version() == 7));
        assert_eq!(versioned.derived().len(), 2);
    }

    #[test]
    fn test_similarity_ignores_init_progress() {
        let a = bundle("storage:2 .1.s:i .1.i:0.2");
        let b = bundle("storage:2 .1.s:i .1.i:0.9");
        assert!(a.similar_to(&b));
        assert!(!a.similar_to(&bundle("storage:2 .1.s:d")));
    }

    #[test]
    fn test_similarity_considers_feed_block() {
        let a = bundle("storage:2");
        let blocked = ClusterStateBundle::builder(annotated("storage:2"))
            .bucket_spaces(["default", "global"])
            .feed_block(Some(FeedBlock::blocked("disk", vec![exhaustion(0, "disk", 0.9)])))
            .derive_and_build();
        assert!(!a.similar_to(&blocked));

        let same_set = ClusterStateBundle::builder(annotated("storage:2"))
            .bucket_spaces(["default", "global"])
            .feed_block(Some(FeedBlock::blocked("disk", vec![exhaustion(0, "disk", 0.95)])))
            .derive_and_build();
        assert!(blocked.similar_to(&same_set));
    }

    #[test]
    fn test_deferred_activation_breaks_similarity() {
        let a = bundle("storage:2");
        let b = ClusterStateBundle::builder(annotated("storage:2"))
            .bucket_spaces(["default", "global"])
            .deferred_activation(true)
            .derive_and_build();
        assert!(!a.similar_to(&b));
    }

    #[test]
    fn test_exhaustion_display() {
        assert_eq!(
            exhaustion(3, "memory", 0.91234).to_string(),
            "memory on node 3 [storage/3] (0.912 > 0.800)"
        );
    }
}
