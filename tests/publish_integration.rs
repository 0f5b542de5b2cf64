//! Cluster state generation, publishing and broadcast against simulated
//! content nodes.

#[allow(dead_code)]
mod common;

use common::*;
use content_controller::database::Database;
use content_controller::state::AnnotatedClusterState;
use content_controller::{ClusterState, ClusterStateBundle, Node, State};
use std::time::Duration;

// ============================================================================
// Publishing and convergence
// ============================================================================

#[tokio::test]
async fn test_publish_and_converge() {
    let mut cluster = SimulatedCluster::new(3, 1);

    let converged = cluster
        .run_until(8, |c| {
            let version = c.published_version(0);
            version >= 2
                && c.published_state(0).node_state(Node::storage(2)).state() == State::Up
                && c.controller(0).broadcaster().last_converged_version() == version
        })
        .await;
    assert!(converged, "{}", cluster.controller(0).published_state());

    let controller = cluster.controller(0);
    assert_eq!(controller.published_state().baseline_state().cluster_state(), State::Up);
    assert_versions_strictly_increasing(controller);

    // Every node received the published version exactly once.
    let version = cluster.published_version(0);
    for node in all_nodes(3) {
        let sent = cluster.communicator(0).versions_sent_to(node);
        assert_eq!(sent.iter().filter(|&&v| v == version).count(), 1, "{}: {:?}", node, sent);
    }
    assert!(cluster.database.stored_latest_version() >= version);
    assert_eq!(
        cluster.database.stored_state_bundle().map(|b| b.version()),
        Some(version)
    );
}

#[tokio::test]
async fn test_idle_cluster_publishes_nothing_new() {
    let mut cluster = SimulatedCluster::new(2, 1);
    cluster.run_rounds(6).await;
    let version = cluster.published_version(0);

    cluster.run_rounds(10).await;
    cluster.advance(Duration::from_secs(10));
    cluster.run_rounds(5).await;
    assert_eq!(cluster.published_version(0), version);
}

#[tokio::test]
async fn test_init_progress_alone_does_not_publish() {
    let mut cluster = SimulatedCluster::new(3, 1);
    cluster.set_node_state(Node::storage(0), initializing(Node::storage(0), 0.1));
    cluster.run_rounds(6).await;
    assert_published_node_state(cluster.controller(0), Node::storage(0), State::Initializing);
    let version = cluster.published_version(0);

    cluster.set_node_state(Node::storage(0), initializing(Node::storage(0), 0.5));
    cluster.run_rounds(4).await;
    assert_eq!(cluster.published_version(0), version);
    assert_eq!(
        cluster
            .controller(0)
            .registry()
            .get(Node::storage(0))
            .map(|info| info.reported_state().init_progress()),
        Some(0.5)
    );

    cluster.set_node_state(Node::storage(0), up(Node::storage(0)));
    cluster.run_rounds(3).await;
    assert!(cluster.published_version(0) > version);
    assert_published_node_state(cluster.controller(0), Node::storage(0), State::Up);
}

#[tokio::test]
async fn test_unstored_version_is_never_broadcast_after_reelection() {
    let mut cluster = SimulatedCluster::new(2, 1);
    cluster.run_rounds(1).await;
    assert_eq!(cluster.master(), Some(0));

    // Our next version never reaches the store.
    cluster.database.set_reject_writes(true);
    cluster.run_rounds(3).await;
    let unstored = cluster.published_version(0);
    assert!(cluster.database.stored_latest_version() < unstored);

    cluster.database.set_connected(false);
    cluster.tick_all().await;
    assert_eq!(cluster.master(), None);

    // Another master stores a different bundle under the same number.
    cluster.database.set_connected(true);
    cluster.database.set_reject_writes(false);
    let theirs: ClusterState = format!("version:{} distributor:2 storage:2 .1.s:d", unstored)
        .parse()
        .unwrap();
    cluster.database.store_latest_version(unstored).await.unwrap();
    cluster
        .database
        .store_state_bundle(&ClusterStateBundle::of_baseline_only(
            AnnotatedClusterState::with_state(theirs),
        ))
        .await
        .unwrap();

    assert!(cluster.run_until(6, |c| c.master() == Some(0)).await);
    cluster.run_rounds(3).await;

    let version = cluster.published_version(0);
    assert!(version > unstored);
    assert_eq!(cluster.database.stored_latest_version(), version);
    for node in all_nodes(2) {
        let sent = cluster.communicator(0).versions_sent_to(node);
        assert!(!sent.contains(&unstored), "{} got unstored version: {:?}", node, sent);
        assert!(sent.contains(&version), "{} missed version {}: {:?}", node, version, sent);
    }
}

// ============================================================================
// Grace period
// ============================================================================

#[tokio::test]
async fn test_storage_node_held_in_maintenance_during_grace_period() {
    let mut cluster = SimulatedCluster::new(3, 1);
    cluster.run_rounds(6).await;
    assert_published_node_state(cluster.controller(0), Node::storage(1), State::Up);

    cluster.kill_node(Node::storage(1));
    cluster.run_rounds(3).await;
    assert_published_node_state(cluster.controller(0), Node::storage(1), State::Maintenance);

    cluster.revive_node(Node::storage(1));
    cluster.advance(Duration::from_secs(1));
    cluster.run_rounds(4).await;
    assert_published_node_state(cluster.controller(0), Node::storage(1), State::Up);
    assert_node_never_in(cluster.controller(0), Node::storage(1), State::Down);
}

#[tokio::test]
async fn test_storage_node_down_after_grace_period() {
    let mut cluster = SimulatedCluster::new(3, 1);
    cluster.run_rounds(6).await;

    cluster.kill_node(Node::storage(1));
    cluster.run_rounds(3).await;
    assert_published_node_state(cluster.controller(0), Node::storage(1), State::Maintenance);

    cluster.advance(Duration::from_secs(31));
    cluster.run_rounds(3).await;
    assert_published_node_state(cluster.controller(0), Node::storage(1), State::Down);
}

#[tokio::test]
async fn test_distributor_goes_down_immediately() {
    let mut cluster = SimulatedCluster::new(3, 1);
    cluster.run_rounds(6).await;

    cluster.kill_node(Node::distributor(2));
    cluster.run_rounds(3).await;
    assert_published_node_state(cluster.controller(0), Node::distributor(2), State::Down);
    assert_node_never_in(cluster.controller(0), Node::distributor(2), State::Maintenance);
}

#[tokio::test]
async fn test_unreachable_node_gets_no_cluster_state() {
    let mut cluster = SimulatedCluster::new(3, 1);
    cluster.run_rounds(6).await;
    let before = cluster.communicator(0).versions_sent_to(Node::storage(1)).len();

    cluster.kill_node(Node::storage(1));
    cluster.run_rounds(4).await;
    let version = cluster.published_version(0);
    let sent = cluster.communicator(0).versions_sent_to(Node::storage(1));
    assert!(!sent[before..].contains(&version), "sent {:?}", sent);

    // Converged without the unreachable storage node.
    assert_eq!(cluster.controller(0).broadcaster().last_converged_version(), version);
}

// ============================================================================
// Two-phase activation
// ============================================================================

#[tokio::test]
async fn test_two_phase_activation() {
    let mut cluster = SimulatedCluster::with_config(2, 1, |config| {
        config.publishing.two_phase_activation = true;
    });

    let converged = cluster
        .run_until(10, |c| {
            let version = c.published_version(0);
            version >= 2
                && c.published_state(0).node_state(Node::storage(1)).state() == State::Up
                && c.controller(0).broadcaster().last_converged_version() == version
        })
        .await;
    assert!(converged);

    let controller = cluster.controller(0);
    assert!(controller.published_state().deferred_activation());
    let version = cluster.published_version(0);
    let activations = cluster.communicator(0).activations_sent();
    for node in all_nodes(2) {
        assert!(
            activations.contains(&(node, version)),
            "no activation of {} sent to {}: {:?}",
            version,
            node,
            activations
        );
    }
}

#[tokio::test]
async fn test_no_activation_before_distributors_ack() {
    let mut cluster = SimulatedCluster::with_config(2, 1, |config| {
        config.publishing.two_phase_activation = true;
    });
    cluster.set_acks_enabled(false);
    cluster.run_rounds(6).await;

    assert!(cluster.published_version(0) >= 2);
    assert!(cluster.communicator(0).activations_sent().is_empty());
    assert_eq!(cluster.controller(0).broadcaster().last_converged_version(), 0);
}
