//! Observability for the controller.
//!
//! Provides logging initialisation and metric helpers. Metrics go through
//! the `metrics` facade; installing an exporter is left to the embedding
//! process.

use crate::config::ObservabilityConfig;
use crate::error::{ControllerError, Result};
use crate::state::{ClusterState, NodeType, State};
use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ControllerError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ControllerError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Record a newly published cluster state.
pub fn record_published_state(state: &ClusterState) {
    counter!("controller_cluster_states_published_total").increment(1);
    gauge!("controller_cluster_state_version").set(f64::from(state.version()));
    gauge!("controller_cluster_up").set(if state.cluster_state() == State::Up { 1.0 } else { 0.0 });
    gauge!("controller_distribution_bits").set(f64::from(state.distribution_bits()));

    for node_type in NodeType::ALL {
        for s in State::ALL {
            let count = state
                .nodes_of_type(node_type)
                .filter(|(_, ns)| ns.state() == s)
                .count();
            gauge!(
                "controller_nodes",
                "type" => node_type.as_str(),
                "state" => s.to_string()
            )
            .set(count as f64);
        }
    }
}

/// Update master election metrics.
pub fn update_master_state(is_master: bool) {
    gauge!("controller_is_master").set(if is_master { 1.0 } else { 0.0 });
}

/// Record a master election edge.
pub fn record_leadership_change(gained: bool) {
    let edge = if gained { "gained" } else { "lost" };
    counter!("controller_leadership_changes_total", "edge" => edge).increment(1);
}

/// Record one control loop tick.
pub fn record_tick(duration_ms: u64, did_work: bool) {
    counter!("controller_ticks_total").increment(1);
    if did_work {
        gauge!("controller_last_busy_tick_ms").set(duration_ms as f64);
    }
}

/// Update the number of queued remote tasks and deferred completions.
pub fn update_task_queues(remote_tasks: usize, deferred: usize) {
    gauge!("controller_remote_tasks_queued").set(remote_tasks as f64);
    gauge!("controller_deferred_tasks_pending").set(deferred as f64);
}

/// Record a deferred task failure.
pub fn record_task_failure(kind: &'static str) {
    counter!("controller_task_failures_total", "kind" => kind).increment(1);
}

/// Record a failed RPC to a node.
pub fn record_rpc_failure(method: &'static str) {
    counter!("controller_rpc_failures_total", "method" => method).increment(1);
}

/// Record a failed coordination store operation.
pub fn record_store_failure() {
    counter!("controller_store_failures_total").increment(1);
}

/// Record a node disabled by the premature crash circuit breaker.
pub fn record_node_disabled() {
    counter!("controller_nodes_disabled_total").increment(1);
}
