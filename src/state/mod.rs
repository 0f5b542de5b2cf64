//! State values shared by every controller component.
//!
//! - [`Node`] / [`NodeType`]: node identity
//! - [`NodeState`] / [`State`]: one node's state and the availability order
//! - [`ClusterState`]: dense per-node states plus global predicates
//! - [`AnnotatedClusterState`]: a cluster state with the reasons behind it
//! - [`ClusterStateBundle`]: baseline plus per-bucket-space derived states

pub mod annotated;
pub mod bundle;
pub mod cluster_state;
pub mod node;
pub mod node_state;

pub use annotated::{AnnotatedClusterState, ClusterStateReason, NodeStateReason};
pub use bundle::{ClusterStateBundle, ClusterStateBundleBuilder, FeedBlock, NodeResourceExhaustion};
pub use cluster_state::{ClusterState, DEFAULT_DISTRIBUTION_BITS};
pub use node::{Node, NodeType};
pub use node_state::{NodeState, State, DEFAULT_MIN_USED_BITS, LISTING_BUCKETS_INIT_PROGRESS_LIMIT};
