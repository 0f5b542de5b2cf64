//! Liveness registry lookup.
//!
//! A [`NodeLookup`] is polled once per tick and reconciles the addresses in
//! the node registry with what the liveness registry currently publishes.
//! The differences come back as [`LookupChange`] values for the temporal
//! tracker to act on.

use super::registry::NodeRegistry;
use crate::state::Node;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One difference found while reconciling with the liveness registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupChange {
    /// First address ever seen for the node.
    NewNode(Node),
    /// The node disappeared from the registry.
    MissingNode(Node),
    /// The node re-registered under a different address.
    NewAddress(Node),
    /// The node re-registered under its previous address.
    ReturnedAddress(Node),
}

impl LookupChange {
    pub fn node(&self) -> Node {
        match self {
            LookupChange::NewNode(node)
            | LookupChange::MissingNode(node)
            | LookupChange::NewAddress(node)
            | LookupChange::ReturnedAddress(node) => *node,
        }
    }
}

pub trait NodeLookup: Send {
    /// Reconcile `registry` with the liveness registry. An empty result
    /// means nothing changed.
    fn update_cluster(&mut self, registry: &mut NodeRegistry, now: u64) -> Vec<LookupChange>;
}

/// An in-process liveness registry. Clones share the same entries, so a
/// test or an embedding service can register nodes while the controller
/// reads them.
#[derive(Debug, Clone, Default)]
pub struct SharedNodeLookup {
    entries: Arc<RwLock<BTreeMap<Node, String>>>,
}

impl SharedNodeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Node, address: impl Into<String>) {
        self.entries.write().insert(node, address.into());
    }

    pub fn unregister(&self, node: Node) {
        self.entries.write().remove(&node);
    }

    pub fn address(&self, node: Node) -> Option<String> {
        self.entries.read().get(&node).cloned()
    }
}

impl NodeLookup for SharedNodeLookup {
    fn update_cluster(&mut self, registry: &mut NodeRegistry, now: u64) -> Vec<LookupChange> {
        let entries = self.entries.read();
        let mut changes = Vec::new();

        for info in registry.node_infos_mut() {
            let node = info.node();
            let registered = entries.get(&node);
            let known = info.rpc_address().map(str::to_owned);

            match (registered, known) {
                (Some(address), None) => {
                    info.set_rpc_address(address.clone());
                    changes.push(LookupChange::NewNode(node));
                }
                (Some(address), Some(previous)) if *address != previous => {
                    info.set_rpc_address(address.clone());
                    changes.push(LookupChange::NewAddress(node));
                }
                (Some(_), Some(_)) if info.is_not_in_lookup() => {
                    info.mark_rpc_address_live();
                    changes.push(LookupChange::ReturnedAddress(node));
                }
                (None, Some(_)) if !info.is_not_in_lookup() => {
                    info.mark_rpc_address_outdated(now);
                    changes.push(LookupChange::MissingNode(node));
                }
                _ => {}
            }
        }
        changes
    }
}
