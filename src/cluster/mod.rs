//! Node registry and observation store.
//!
//! This module owns what the controller knows about each content node:
//! - Configured node set and distribution topology
//! - Reported and wanted states, stability timers
//! - Liveness registry addresses
//! - Host info (bucket space stats, resource usage)

mod distribution;
mod host_info;
mod lookup;
mod node_info;
mod registry;

pub use distribution::{Distribution, Group};
pub use host_info::{
    BucketCounts, BucketSpaceReport, ContentNodeHostInfo, DistributorHostInfo, HostInfo,
    ResourceUsage, StorageNodeStatsReport,
};
pub use lookup::{LookupChange, NodeLookup, SharedNodeLookup};
pub use node_info::{NodeInfo, NodeStateRequest, LATEST_RPC_VERSION, OLDEST_RPC_VERSION};
pub use registry::{ConfiguredNode, NodeRegistry};
