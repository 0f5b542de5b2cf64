//! Host info reported by nodes alongside their node state.
//!
//! Distributors report per storage node, per bucket space bucket counts;
//! content nodes report resource usage. Unknown fields are ignored.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Cluster state version the node currently runs with.
    #[serde(rename = "cluster-state-version", default, skip_serializing_if = "Option::is_none")]
    pub cluster_state_version: Option<u32>,
    /// Present in distributor replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributor: Option<DistributorHostInfo>,
    /// Present in storage node replies.
    #[serde(rename = "content-node", default, skip_serializing_if = "Option::is_none")]
    pub content_node: Option<ContentNodeHostInfo>,
}

impl HostInfo {
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }

    /// Resource usage by resource name; empty for non-storage nodes.
    pub fn resource_usage(&self) -> impl Iterator<Item = (&str, f64)> {
        self.content_node
            .iter()
            .flat_map(|c| c.resource_usage.iter())
            .map(|(name, usage)| (name.as_str(), usage.usage))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributorHostInfo {
    #[serde(rename = "storage-nodes", default)]
    pub storage_nodes: Vec<StorageNodeStatsReport>,
}

/// A distributor's view of one storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNodeStatsReport {
    #[serde(rename = "node-index")]
    pub node_index: u16,
    #[serde(rename = "bucket-spaces", default)]
    pub bucket_spaces: Vec<BucketSpaceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSpaceReport {
    pub name: String,
    /// Missing when the distributor does not yet know the counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<BucketCounts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub total: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentNodeHostInfo {
    #[serde(rename = "resource-usage", default)]
    pub resource_usage: BTreeMap<String, ResourceUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub usage: f64,
}
