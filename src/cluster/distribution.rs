//! Distribution topology: the group tree content nodes are placed in.
//!
//! A flat topology is a root group holding every node directly. A
//! hierarchical topology has subgroups; only leaf groups hold nodes.

use serde::{Deserialize, Serialize};

/// One group in the topology tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name, unique among siblings.
    pub name: String,
    /// Group index, unique among siblings.
    #[serde(default)]
    pub index: u16,
    /// Node indices placed directly in this group. Empty for branch groups.
    #[serde(default)]
    pub nodes: Vec<u16>,
    /// Child groups.
    #[serde(default)]
    pub subgroups: Vec<Group>,
}

impl Group {
    pub fn leaf(name: impl Into<String>, index: u16, nodes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            name: name.into(),
            index,
            nodes: nodes.into_iter().collect(),
            subgroups: Vec::new(),
        }
    }

    pub fn branch(name: impl Into<String>, index: u16, subgroups: Vec<Group>) -> Self {
        Self {
            name: name.into(),
            index,
            nodes: Vec::new(),
            subgroups,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.subgroups.is_empty()
    }

    /// Leaf groups below (or equal to) this group, depth first.
    pub fn leaf_groups(&self) -> Vec<&Group> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Group>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for group in &self.subgroups {
                group.collect_leaves(out);
            }
        }
    }

    /// Every node index in this subtree.
    pub fn all_nodes(&self) -> Vec<u16> {
        self.leaf_groups()
            .into_iter()
            .flat_map(|g| g.nodes.iter().copied())
            .collect()
    }
}

/// The configured distribution topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub root: Group,
}

impl Distribution {
    /// A flat topology with every node in the root group.
    pub fn flat(nodes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            root: Group::leaf("root", 0, nodes),
        }
    }

    pub fn hierarchical(subgroups: Vec<Group>) -> Self {
        Self {
            root: Group::branch("root", 0, subgroups),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.root.is_leaf()
    }

    pub fn leaf_groups(&self) -> Vec<&Group> {
        self.root.leaf_groups()
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::flat(Vec::new())
    }
}
