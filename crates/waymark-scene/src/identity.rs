//! Cross-session node identity.
//!
//! Node handles ([`NodeId`]) change every run, so anything persisted must be
//! keyed by identity derived from the scene itself. An [`IdentityGenerator`]
//! turns a live node into a [`NodeIdentity`] made of four strings:
//!
//! - **item path** -- node names from the root, joined with `/`. Human
//!   readable, and the first key the store consults.
//! - **path id** -- derived purely from hierarchical position: the sequence of
//!   `(sibling index, name)` pairs from the root.
//! - **item id** -- derived from intrinsic content only: the sorted set of
//!   component type names and asset references. Survives re-parenting and
//!   renames that defeat the two keys above.
//! - **unique id** -- combines path id and item id; the primary record key.
//!
//! [`HierarchyIdentity`] is the stock implementation, hashing with BLAKE3.

use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::tree::SceneGraph;

/// Length of the hex digests produced by [`HierarchyIdentity`].
pub const IDENTITY_HEX_LEN: usize = 32;

// ---------------------------------------------------------------------------
// NodeIdentity
// ---------------------------------------------------------------------------

/// The four derived identity strings of one live node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub item_path: String,
    pub path_id: String,
    pub item_id: String,
    pub unique_id: String,
}

impl NodeIdentity {
    /// Sentinel returned for stale or destroyed handles.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.unique_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// IdentityGenerator
// ---------------------------------------------------------------------------

/// Derives stable identity strings for live nodes.
///
/// Implementations must be pure: the same scene content yields the same
/// strings in every process, regardless of the numeric handles involved. They
/// must not panic for a live node and must return [`NodeIdentity::empty`] for
/// a stale one.
pub trait IdentityGenerator {
    fn identify(&self, scene: &dyn SceneGraph, node: NodeId) -> NodeIdentity;
}

// ---------------------------------------------------------------------------
// HierarchyIdentity
// ---------------------------------------------------------------------------

/// BLAKE3-based [`IdentityGenerator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchyIdentity;

impl HierarchyIdentity {
    pub fn new() -> Self {
        Self
    }

    /// Position-only fingerprint: `(sibling index, name)` from the root down.
    pub fn path_id(&self, scene: &dyn SceneGraph, node: NodeId) -> Option<String> {
        let mut chain: Vec<(usize, &str)> = Vec::new();
        let mut current = Some(node);
        while let Some(cur) = current {
            let n = scene.node(cur)?;
            chain.push((scene.sibling_index(cur)?, n.name.as_str()));
            current = n.parent;
        }
        chain.reverse();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"waymark.path_id.v1");
        for (index, name) in chain {
            hasher.update(&(index as u64).to_le_bytes());
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
        }
        Some(truncated_hex(hasher.finalize()))
    }

    /// Content-only fingerprint: sorted component types and asset references.
    pub fn item_id(&self, scene: &dyn SceneGraph, node: NodeId) -> Option<String> {
        let n = scene.node(node)?;
        let mut parts: Vec<String> = n
            .components
            .iter()
            .map(|c| format!("{}|{}", c.type_name, c.asset_ref.as_deref().unwrap_or("")))
            .collect();
        parts.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"waymark.item_id.v1");
        for part in &parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Some(truncated_hex(hasher.finalize()))
    }
}

impl IdentityGenerator for HierarchyIdentity {
    fn identify(&self, scene: &dyn SceneGraph, node: NodeId) -> NodeIdentity {
        let (Some(item_path), Some(path_id), Some(item_id)) = (
            scene.path_of(node),
            self.path_id(scene, node),
            self.item_id(scene, node),
        ) else {
            return NodeIdentity::empty();
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"waymark.unique_id.v1");
        hasher.update(path_id.as_bytes());
        hasher.update(item_id.as_bytes());
        let unique_id = truncated_hex(hasher.finalize());

        NodeIdentity {
            item_path,
            path_id,
            item_id,
            unique_id,
        }
    }
}

fn truncated_hex(hash: blake3::Hash) -> String {
    let mut hex = hash.to_hex().to_string();
    hex.truncate(IDENTITY_HEX_LEN);
    hex
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::tree::{NodeTemplate, SceneTree};

    fn level() -> NodeTemplate {
        NodeTemplate::new("Level")
            .child(
                NodeTemplate::new("Machine")
                    .with(Component::renderer("mesh/press"))
                    .with(Component::collider()),
            )
            .child(NodeTemplate::new("Shelf").with(Component::renderer("mesh/shelf")))
    }

    #[test]
    fn identity_is_stable_across_separate_trees() {
        let ids = HierarchyIdentity::new();

        let mut a = SceneTree::new("Factory");
        a.spawn(&level(), None).unwrap();

        // Different allocation history -> different handles, same content.
        let mut b = SceneTree::new("Factory");
        let junk = b
            .spawn(&NodeTemplate::new("Junk").child(NodeTemplate::new("Bits")), None)
            .unwrap();
        b.destroy(junk).unwrap();
        b.spawn(&level(), None).unwrap();

        let ida = a.find_by_path("Level/Machine").unwrap();
        let idb = b.find_by_path("Level/Machine").unwrap();
        assert_ne!(ida, idb);
        assert_eq!(ids.identify(&a, ida), ids.identify(&b, idb));
    }

    #[test]
    fn item_id_survives_reparent_and_rename() {
        let ids = HierarchyIdentity::new();
        let mut tree = SceneTree::new("Factory");
        tree.spawn(&level(), None).unwrap();
        let machine = tree.find_by_path("Level/Machine").unwrap();
        let before = ids.identify(&tree, machine);

        tree.reparent(machine, None).unwrap();
        tree.rename(machine, "Press").unwrap();
        let after = ids.identify(&tree, machine);

        assert_eq!(before.item_id, after.item_id);
        assert_ne!(before.path_id, after.path_id);
        assert_ne!(before.unique_id, after.unique_id);
        assert_eq!(after.item_path, "Press");
    }

    #[test]
    fn item_id_is_component_order_independent() {
        let ids = HierarchyIdentity::new();
        let mut tree = SceneTree::new("Factory");
        let a = tree
            .spawn(
                &NodeTemplate::new("A")
                    .with(Component::renderer("mesh/x"))
                    .with(Component::collider()),
                None,
            )
            .unwrap();
        let b = tree
            .spawn(
                &NodeTemplate::new("B")
                    .with(Component::collider())
                    .with(Component::renderer("mesh/x")),
                None,
            )
            .unwrap();
        assert_eq!(ids.item_id(&tree, a), ids.item_id(&tree, b));
    }

    #[test]
    fn sibling_order_changes_path_id() {
        let ids = HierarchyIdentity::new();
        let mut tree = SceneTree::new("Factory");
        let root = tree.spawn(&level(), None).unwrap();
        let shelf = tree.find_by_path("Level/Shelf").unwrap();
        let before = ids.identify(&tree, shelf);

        let machine = tree.find_by_path("Level/Machine").unwrap();
        tree.reparent(machine, Some(root)).unwrap(); // Machine moves after Shelf.
        let after = ids.identify(&tree, shelf);

        assert_eq!(before.item_path, after.item_path);
        assert_ne!(before.path_id, after.path_id);
    }

    #[test]
    fn stale_node_yields_empty_identity() {
        let ids = HierarchyIdentity::new();
        let mut tree = SceneTree::new("Factory");
        let root = tree.spawn(&level(), None).unwrap();
        tree.destroy(root).unwrap();
        let identity = ids.identify(&tree, root);
        assert!(identity.is_empty());
        assert_eq!(identity, NodeIdentity::empty());
    }

    #[test]
    fn digests_have_fixed_length() {
        let ids = HierarchyIdentity::new();
        let mut tree = SceneTree::new("Factory");
        let root = tree.spawn(&level(), None).unwrap();
        let id = ids.identify(&tree, root);
        assert_eq!(id.path_id.len(), IDENTITY_HEX_LEN);
        assert_eq!(id.item_id.len(), IDENTITY_HEX_LEN);
        assert_eq!(id.unique_id.len(), IDENTITY_HEX_LEN);
    }
}
