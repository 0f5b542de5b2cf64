//! Configuration module for the content cluster controller.

use crate::cluster::{ConfiguredNode, Distribution};
use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// Main configuration for one controller replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name of the content cluster this controller manages.
    pub cluster_name: String,
    /// Replica identity and election settings.
    #[serde(default)]
    pub controller: ReplicaConfig,
    /// Configured content nodes. Each index is a distributor and a storage node.
    #[serde(default)]
    pub nodes: Vec<ConfiguredNode>,
    /// Group topology of the storage nodes.
    #[serde(default)]
    pub distribution: Distribution,
    /// Timers and grace periods.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Cluster up/down and node stability policy.
    #[serde(default)]
    pub policy: StatePolicyConfig,
    /// Cluster state publishing.
    #[serde(default)]
    pub publishing: PublishConfig,
    /// Resource exhaustion feed block.
    #[serde(default)]
    pub feed_block: FeedBlockConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ControllerConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ControllerError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(ControllerError::InvalidConfig {
                field: "cluster_name".to_string(),
                reason: "Cluster name must be non-empty".to_string(),
            });
        }

        if self.controller.count == 0 || self.controller.index >= self.controller.count {
            return Err(ControllerError::InvalidConfig {
                field: "controller.index".to_string(),
                reason: format!(
                    "Index {} is outside a cluster of {} controllers",
                    self.controller.index, self.controller.count
                ),
            });
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.index) {
                return Err(ControllerError::InvalidConfig {
                    field: "nodes".to_string(),
                    reason: format!("Node index {} is listed twice", node.index),
                });
            }
        }

        for node in self.distribution.root.all_nodes() {
            if !seen.contains(&node) {
                return Err(ControllerError::InvalidConfig {
                    field: "distribution".to_string(),
                    reason: format!("Group references unconfigured node {}", node),
                });
            }
        }

        for (field, ratio) in [
            ("policy.min_storage_up_ratio", self.policy.min_storage_up_ratio),
            ("policy.min_distributor_up_ratio", self.policy.min_distributor_up_ratio),
            ("policy.min_node_ratio_per_group", self.policy.min_node_ratio_per_group),
            ("publishing.min_merge_completion_ratio", self.publishing.min_merge_completion_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ControllerError::InvalidConfig {
                    field: field.to_string(),
                    reason: format!("Ratio {} must be within [0, 1]", ratio),
                });
            }
        }

        if self.policy.ideal_distribution_bits == 0 || self.policy.ideal_distribution_bits > 64 {
            return Err(ControllerError::InvalidConfig {
                field: "policy.ideal_distribution_bits".to_string(),
                reason: "Distribution bits must be within [1, 64]".to_string(),
            });
        }

        if self.publishing.max_history_entries == 0 {
            return Err(ControllerError::InvalidConfig {
                field: "publishing.max_history_entries".to_string(),
                reason: "History must keep at least one entry".to_string(),
            });
        }

        Ok(())
    }

    /// Identity of this replica; changing it at runtime is fatal.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.cluster_name, self.controller.index)
    }

    /// A single-replica configuration with `node_count` flat nodes and
    /// timers short enough for development.
    pub fn development(node_count: u16) -> Self {
        Self {
            cluster_name: "dev".to_string(),
            controller: ReplicaConfig::default(),
            nodes: (0..node_count).map(ConfiguredNode::new).collect(),
            distribution: Distribution::flat(0..node_count),
            timing: TimingConfig {
                min_time_before_first_state_broadcast: Duration::ZERO,
                min_time_between_new_states: Duration::ZERO,
                ..TimingConfig::default()
            },
            policy: StatePolicyConfig::default(),
            publishing: PublishConfig::default(),
            feed_block: FeedBlockConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Replica identity and master election settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// This replica's index among the controllers.
    pub index: u32,
    /// Total number of controller replicas.
    pub count: u32,
    /// Replicas among the first this many in election order gather node states.
    pub state_gather_count: u32,
    /// How long a new master waits after the previous one disappeared.
    #[serde(with = "humantime_serde")]
    pub master_cooldown_period: Duration,
    /// Sleep between idle control loop ticks.
    #[serde(with = "humantime_serde")]
    pub cycle_wait_time: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            index: 0,
            count: 1,
            state_gather_count: 2,
            master_cooldown_period: Duration::from_secs(60),
            cycle_wait_time: Duration::from_millis(100),
        }
    }
}

/// Timers and grace periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Grace period a storage node is held in Maintenance after going down.
    #[serde(with = "humantime_serde")]
    pub storage_transition_time: Duration,
    /// Same for distributors. Distributors are never held, so usually zero.
    #[serde(with = "humantime_serde")]
    pub distributor_transition_time: Duration,
    /// Longest a storage node may sit at the same init progress. Zero disables.
    #[serde(with = "humantime_serde")]
    pub max_init_progress_time: Duration,
    /// A node up or down for this long has its premature crash count reset.
    #[serde(with = "humantime_serde")]
    pub stable_state_time_period: Duration,
    /// How long a node may be missing from the liveness registry before it
    /// is considered down.
    #[serde(with = "humantime_serde")]
    pub max_lookup_disconnect_grace_period: Duration,
    /// Minimum time after becoming master before the first broadcast,
    /// unless every node has reported.
    #[serde(with = "humantime_serde")]
    pub min_time_before_first_state_broadcast: Duration,
    /// Minimum time between two cluster state broadcasts.
    #[serde(with = "humantime_serde")]
    pub min_time_between_new_states: Duration,
    /// Timeout for `getNodeState` requests.
    #[serde(with = "humantime_serde")]
    pub node_state_request_timeout: Duration,
    /// How long a sent cluster state may go unanswered before resending.
    #[serde(with = "humantime_serde")]
    pub set_cluster_state_timeout: Duration,
    /// Upper bound on how long a task waits for its version to converge.
    #[serde(with = "humantime_serde")]
    pub max_deferred_task_version_wait_time: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            storage_transition_time: Duration::from_secs(30),
            distributor_transition_time: Duration::ZERO,
            max_init_progress_time: Duration::from_secs(5),
            stable_state_time_period: Duration::from_secs(2 * 60 * 60),
            max_lookup_disconnect_grace_period: Duration::from_secs(1),
            min_time_before_first_state_broadcast: Duration::from_secs(30),
            min_time_between_new_states: Duration::from_millis(200),
            node_state_request_timeout: Duration::from_secs(60),
            set_cluster_state_timeout: Duration::from_secs(30),
            max_deferred_task_version_wait_time: Duration::from_secs(30),
        }
    }
}

/// Cluster up/down predicates and node stability policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatePolicyConfig {
    /// Premature crashes tolerated before a node is disabled. Zero disables
    /// the circuit breaker.
    pub max_premature_crashes: u32,
    pub min_storage_nodes_up: usize,
    pub min_distributor_nodes_up: usize,
    pub min_storage_up_ratio: f64,
    pub min_distributor_up_ratio: f64,
    /// Leaf groups with a lower ratio of available nodes are taken out.
    pub min_node_ratio_per_group: f64,
    pub ideal_distribution_bits: u32,
}

impl Default for StatePolicyConfig {
    fn default() -> Self {
        Self {
            max_premature_crashes: 100_000,
            min_storage_nodes_up: 1,
            min_distributor_nodes_up: 1,
            min_storage_up_ratio: 0.5,
            min_distributor_up_ratio: 0.5,
            min_node_ratio_per_group: 0.0,
            ideal_distribution_bits: 16,
        }
    }
}

/// Cluster state publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Published bundles kept in history.
    pub max_history_entries: usize,
    /// Send an explicit activation after every distributor acked a version.
    pub two_phase_activation: bool,
    /// Bucket spaces to derive states for. Empty means baseline only.
    pub bucket_spaces: Vec<String>,
    /// Hold default-space nodes in Maintenance while global merges are pending.
    pub maintenance_on_pending_global_merges: bool,
    /// Completion ratio below which a node may have merges pending.
    pub min_merge_completion_ratio: f64,
    /// Longest list of unconverged nodes put in a task error.
    pub max_divergent_nodes_printed: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_history_entries: 50,
            two_phase_activation: false,
            bucket_spaces: vec!["default".to_string(), "global".to_string()],
            maintenance_on_pending_global_merges: false,
            min_merge_completion_ratio: 1.0,
            max_divergent_nodes_printed: 10,
        }
    }
}

/// Resource exhaustion feed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedBlockConfig {
    pub enabled: bool,
    /// Usage limit per resource name, e.g. `disk` and `memory`.
    pub limits: BTreeMap<String, f64>,
    /// Hysteresis subtracted from a limit while a node is already blocked.
    pub noise_level: f64,
}

impl Default for FeedBlockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limits: BTreeMap::from([("disk".to_string(), 0.8), ("memory".to_string(), 0.8)]),
            noise_level: 0.01,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON formatted logs.
    pub json_logs: bool,
    /// Events kept in the in-memory event log.
    pub max_events: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            max_events: 1024,
        }
    }
}

/// Serde helpers for durations written as `"500ms"`, `"5s"` or `"2m"`.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("'{}': {}", s, e));
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).map(|v| Duration::from_secs(v * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse(hours).map(|v| Duration::from_secs(v * 60 * 60))
        } else {
            parse(s).map(Duration::from_millis)
        }
    }
}
