//! Master election across controller replicas sharing a coordination store.

#[allow(dead_code)]
mod common;

use common::*;
use content_controller::clock::Clock;
use content_controller::{Node, State};
use std::time::Duration;

// ============================================================================
// Election
// ============================================================================

#[tokio::test]
async fn test_lowest_replica_becomes_master_with_unanimous_votes() {
    let mut cluster = SimulatedCluster::new(2, 3);

    assert!(cluster.run_until(5, |c| c.master().is_some()).await);
    assert_eq!(cluster.master(), Some(0));

    let votes = cluster.database.stored_votes();
    assert_eq!(votes.len(), 3);
    assert!(votes.values().all(|&v| v == 0), "votes: {:?}", votes);

    // Followers agree on who is master.
    let now = cluster.clock.now_millis();
    for index in 1..3 {
        assert_eq!(cluster.controller(index).election().master(now), Some(0));
        assert!(!cluster.controller(index).is_master());
    }
}

#[tokio::test]
async fn test_only_master_publishes_and_broadcasts() {
    let mut cluster = SimulatedCluster::new(2, 3);
    cluster.run_rounds(6).await;

    assert_eq!(cluster.master(), Some(0));
    assert!(cluster.published_version(0) >= 2);
    assert_published_node_state(cluster.controller(0), Node::storage(1), State::Up);

    for index in 1..3 {
        assert!(cluster.controller(index).tracker().history().is_empty());
        let sent = cluster
            .communicator(index)
            .versions_sent_to(Node::distributor(0));
        assert!(sent.is_empty(), "replica {} broadcast {:?}", index, sent);
    }
}

#[tokio::test]
async fn test_failover_waits_for_cooldown() {
    let mut cluster = SimulatedCluster::new(2, 3);
    cluster.run_rounds(6).await;
    assert_eq!(cluster.master(), Some(0));
    let old_version = cluster.published_version(0);

    cluster.stop_replica(0);
    cluster.run_rounds(4).await;
    assert_eq!(cluster.master(), None, "new master before cooldown");

    cluster.advance(Duration::from_secs(6));
    assert!(cluster.run_until(4, |c| c.master().is_some()).await);
    assert_eq!(cluster.master(), Some(1));

    // The new master resumes from the stored version.
    assert!(cluster.run_until(4, |c| c.published_version(1) > old_version).await);
    assert!(cluster.published_version(1) > old_version);
    assert_published_node_state(cluster.controller(1), Node::storage(0), State::Up);
}

#[tokio::test]
async fn test_lost_store_connection_drops_mastership() {
    let mut cluster = SimulatedCluster::new(1, 1);
    cluster.run_rounds(2).await;
    assert_eq!(cluster.master(), Some(0));

    cluster.database.set_connected(false);
    cluster.tick_all().await;
    assert_eq!(cluster.master(), None);

    cluster.database.set_connected(true);
    assert!(cluster.run_until(4, |c| c.master().is_some()).await);
}

#[tokio::test]
async fn test_wanted_state_set_while_not_master_is_stored_after_election() {
    let mut cluster = SimulatedCluster::with_config(2, 1, |config| {
        config.policy.max_premature_crashes = 1;
    });
    cluster.run_rounds(6).await;
    assert_eq!(cluster.master(), Some(0));

    cluster.database.set_connected(false);
    cluster.tick_all().await;
    assert_eq!(cluster.master(), None);

    // Two crashes in a row trip the circuit breaker while not master.
    let node = Node::storage(1);
    for _ in 0..2 {
        cluster.kill_node(node);
        cluster.run_rounds(2).await;
        cluster.revive_node(node);
        cluster.advance(Duration::from_secs(1));
        cluster.run_rounds(2).await;
    }
    let wanted = cluster
        .controller(0)
        .registry()
        .get(node)
        .map(|info| info.user_wanted_state().state());
    assert_eq!(wanted, Some(State::Down));
    assert!(cluster.database.stored_wanted_states().is_empty());

    cluster.database.set_connected(true);
    assert!(cluster.run_until(4, |c| c.master().is_some()).await);
    cluster.run_rounds(2).await;

    let stored = cluster.database.stored_wanted_states();
    assert_eq!(stored.get(&node).map(|s| s.state()), Some(State::Down));
    assert_published_node_state(cluster.controller(0), node, State::Down);
}
