//! Bucket space statistics.
//!
//! Every distributor reports, per storage node and bucket space, how many
//! buckets it knows of and how many are still pending merges. The
//! [`ClusterStatsAggregator`] folds these into one cluster-wide view, which
//! decides whether a storage node may still have merges pending.

mod aggregator;
mod change_tracker;

pub use aggregator::{
    BucketSpaceStats, ClusterStatsAggregator, ContentClusterStats, ContentNodeStats,
    MergePendingChecker,
};
pub use change_tracker::ClusterStatsChangeTracker;

/// Bucket space holding regular documents.
pub const DEFAULT_SPACE: &str = "default";
/// Bucket space holding globally distributed documents.
pub const GLOBAL_SPACE: &str = "global";
