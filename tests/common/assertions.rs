//! Assertions over published cluster state history.

use content_controller::{Controller, Node, State};

/// Published versions, newest first, must strictly decrease.
pub fn assert_versions_strictly_increasing(controller: &Controller) {
    let versions: Vec<u32> = controller
        .tracker()
        .history()
        .iter()
        .map(|entry| entry.version())
        .collect();
    for pair in versions.windows(2) {
        assert!(
            pair[0] > pair[1],
            "history versions not strictly ordered: {:?}",
            versions
        );
    }
}

/// No published baseline ever had `node` in `state`.
pub fn assert_node_never_in(controller: &Controller, node: Node, state: State) {
    for entry in controller.tracker().history() {
        assert_ne!(
            entry.bundle().baseline_state().node_state(node).state(),
            state,
            "{} was {:?} in version {}",
            node,
            state,
            entry.version()
        );
    }
}

pub fn assert_published_node_state(controller: &Controller, node: Node, state: State) {
    let published = controller.published_state();
    assert_eq!(
        published.baseline_state().node_state(node).state(),
        state,
        "{} in published version {}: {}",
        node,
        published.version(),
        published
    );
}
