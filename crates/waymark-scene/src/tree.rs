//! The live scene abstraction and an in-memory host implementation.
//!
//! [`SceneGraph`] is the seam between Waymark and whatever engine owns the
//! actual object hierarchy. It exposes a read view of the node forest plus the
//! four mutations the apply layer needs: set a local transform, destroy a
//! subtree, instantiate a prefab, and tag a node as Store-managed.
//!
//! [`SceneTree`] is a complete in-memory implementation used by headless tools,
//! tests, and benchmarks. Nodes live in a slot vector addressed by generational
//! [`NodeId`]s so a handle to a destroyed node reads back as `None` instead of
//! aliasing a newer node in the same slot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentKind};
use crate::node::NodeId;
use crate::transform::{Transform, Vec3};
use crate::SceneError;

// ---------------------------------------------------------------------------
// SceneNode
// ---------------------------------------------------------------------------

/// Marks a node that Waymark created from a spawned record.
///
/// The bake pass records such nodes under `record_key` instead of treating
/// them as new native objects, and the apply layer matches them by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedTag {
    pub record_key: String,
    pub prefab_path: String,
}

/// Read view of one live node.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    /// The node's own active flag. Effective activity also depends on ancestors,
    /// see [`SceneGraph::is_active_in_hierarchy`].
    pub active_self: bool,
    pub components: Vec<Component>,
    /// Local-space transform.
    pub transform: Transform,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub managed: Option<ManagedTag>,
}

impl SceneNode {
    /// Returns `true` if any component on this node has the given kind.
    pub fn has_kind(&self, kind: ComponentKind) -> bool {
        self.components.iter().any(|c| c.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// NodeTemplate
// ---------------------------------------------------------------------------

/// Declarative description of a node subtree, used both to build scenes and
/// as the body of a registered prefab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub children: Vec<NodeTemplate>,
}

fn default_active() -> bool {
    true
}

impl NodeTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            components: Vec::new(),
            transform: Transform::IDENTITY,
            children: Vec::new(),
        }
    }

    pub fn with(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.transform.position = position;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn child(mut self, child: NodeTemplate) -> Self {
        self.children.push(child);
        self
    }

    /// Total number of nodes in this template, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(NodeTemplate::node_count).sum::<usize>()
    }
}

// ---------------------------------------------------------------------------
// SceneGraph
// ---------------------------------------------------------------------------

/// A live, mutable object forest owned by the host.
///
/// All traversal in Waymark goes through this trait. Implementations must
/// return `None` from [`node`](Self::node) for stale handles rather than
/// panicking; the walkers rely on that to skip nodes destroyed mid-pass.
pub trait SceneGraph {
    /// Name of the loaded scene; used as the store partition key.
    fn scene_name(&self) -> &str;

    /// Root nodes in sibling order.
    fn roots(&self) -> &[NodeId];

    fn node(&self, id: NodeId) -> Option<&SceneNode>;

    /// Overwrite the local transform of a node.
    fn set_local_transform(&mut self, id: NodeId, transform: Transform) -> Result<(), SceneError>;

    /// Destroy a node and its whole subtree.
    fn destroy(&mut self, id: NodeId) -> Result<(), SceneError>;

    /// Instantiate the prefab registered under `prefab` below `parent` (or as a
    /// root) with the given local transform. Returns the new subtree root.
    fn instantiate(
        &mut self,
        prefab: &str,
        parent: Option<NodeId>,
        transform: Transform,
    ) -> Result<NodeId, SceneError>;

    fn set_managed(&mut self, id: NodeId, tag: ManagedTag) -> Result<(), SceneError>;

    // -- provided -----------------------------------------------------------

    fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Children of `id` in sibling order, or an empty slice for a stale handle.
    fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// `true` when the node and all of its ancestors are active.
    fn is_active_in_hierarchy(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            match self.node(cur) {
                Some(node) if node.active_self => current = node.parent,
                _ => return false,
            }
        }
        true
    }

    /// Position of the node among its siblings (or among the roots).
    fn sibling_index(&self, id: NodeId) -> Option<usize> {
        let node = self.node(id)?;
        let siblings = match node.parent {
            Some(parent) => self.children(parent),
            None => self.roots(),
        };
        siblings.iter().position(|&s| s == id)
    }

    /// Names from the root down to `id`, joined with `/`.
    fn path_of(&self, id: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let node = self.node(cur)?;
            names.push(node.name.as_str());
            current = node.parent;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// First node (in sibling order) whose [`path_of`](Self::path_of) equals `path`.
    fn find_by_path(&self, path: &str) -> Option<NodeId> {
        let mut frontier: Vec<NodeId> = self.roots().to_vec();
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            let matches: Vec<NodeId> = frontier
                .iter()
                .copied()
                .filter(|&n| self.node(n).is_some_and(|node| node.name == segment))
                .collect();
            if segments.peek().is_none() {
                return matches.first().copied();
            }
            frontier = matches
                .iter()
                .flat_map(|&n| self.children(n).iter().copied())
                .collect();
            if frontier.is_empty() {
                return None;
            }
        }
        None
    }

    /// `true` if any strict descendant of `id` has a component of `kind`.
    fn subtree_has_kind(&self, id: NodeId, kind: ComponentKind) -> bool {
        let mut stack: Vec<NodeId> = self.children(id).to_vec();
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.node(cur) {
                if node.has_kind(kind) {
                    return true;
                }
                stack.extend_from_slice(&node.children);
            }
        }
        false
    }

    /// Every reachable node in depth-first pre-order.
    fn depth_first(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.roots().iter().rev().copied().collect();
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.node(cur) {
                out.push(cur);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// SceneTree
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<SceneNode>,
}

/// In-memory [`SceneGraph`] with a prefab library.
#[derive(Debug)]
pub struct SceneTree {
    name: String,
    /// Indexed by `NodeId::slot`.
    slots: Vec<Slot>,
    /// Empty slots, reused most-recently-freed first.
    free: Vec<u32>,
    live: usize,
    roots: Vec<NodeId>,
    prefabs: HashMap<String, NodeTemplate>,
}

impl SceneTree {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            roots: Vec::new(),
            prefabs: HashMap::new(),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make `template` available to [`SceneGraph::instantiate`] under `path`.
    pub fn register_prefab(&mut self, path: impl Into<String>, template: NodeTemplate) {
        self.prefabs.insert(path.into(), template);
    }

    /// Build `template` as a new subtree under `parent` (or as a root).
    pub fn spawn(
        &mut self,
        template: &NodeTemplate,
        parent: Option<NodeId>,
    ) -> Result<NodeId, SceneError> {
        if let Some(p) = parent {
            if !self.contains(p) {
                return Err(SceneError::StaleNode { node: p });
            }
        }
        let node = SceneNode {
            name: template.name.clone(),
            active_self: template.active,
            components: template.components.clone(),
            transform: template.transform,
            parent,
            children: Vec::new(),
            managed: None,
        };
        let id = self.insert(node);
        match parent {
            Some(p) => self.attach_child(p, id),
            None => self.roots.push(id),
        }
        for child in &template.children {
            self.spawn(child, Some(id))?;
        }
        Ok(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.node.as_mut()
    }

    pub fn set_active(&mut self, id: NodeId, active: bool) -> Result<(), SceneError> {
        let node = self.node_mut(id).ok_or(SceneError::StaleNode { node: id })?;
        node.active_self = active;
        Ok(())
    }

    pub fn rename(&mut self, id: NodeId, name: impl Into<String>) -> Result<(), SceneError> {
        let node = self.node_mut(id).ok_or(SceneError::StaleNode { node: id })?;
        node.name = name.into();
        Ok(())
    }

    /// Move `id` under `new_parent` (or to the root list), appended last.
    pub fn reparent(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<(), SceneError> {
        if !self.contains(id) {
            return Err(SceneError::StaleNode { node: id });
        }
        if let Some(p) = new_parent {
            if !self.contains(p) {
                return Err(SceneError::StaleNode { node: p });
            }
            let mut cursor = Some(p);
            while let Some(cur) = cursor {
                if cur == id {
                    return Err(SceneError::InvalidParent {
                        node: id,
                        parent: p,
                        details: "new parent is inside the node's own subtree".to_owned(),
                    });
                }
                cursor = self.node(cur).and_then(|n| n.parent);
            }
        }
        self.detach(id);
        if let Some(node) = self.node_mut(id) {
            node.parent = new_parent;
        }
        tracing::debug!(node = %id, parent = ?new_parent, "node reparented");
        match new_parent {
            Some(p) => self.attach_child(p, id),
            None => self.roots.push(id),
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn insert(&mut self, node: SceneNode) -> NodeId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId::new(self.slots.len() as u32 - 1, 0)
            }
        }
    }

    /// Empty the slot behind `id` and retire its generation.
    fn take(&mut self, id: NodeId) -> Option<SceneNode> {
        let slot = self.slots.get_mut(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot());
        self.live -= 1;
        Some(node)
    }

    fn attach_child(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.node_mut(parent) {
            p.children.push(child);
        }
    }

    /// Remove `id` from its parent's child list (or from the roots).
    fn detach(&mut self, id: NodeId) {
        let parent = self.node(id).and_then(|n| n.parent);
        match parent {
            Some(p) => {
                if let Some(pn) = self.node_mut(p) {
                    pn.children.retain(|&c| c != id);
                }
            }
            None => self.roots.retain(|&r| r != id),
        }
    }
}

impl SceneGraph for SceneTree {
    fn scene_name(&self) -> &str {
        &self.name
    }

    fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    fn node(&self, id: NodeId) -> Option<&SceneNode> {
        let slot = self.slots.get(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.node.as_ref()
    }

    fn set_local_transform(&mut self, id: NodeId, transform: Transform) -> Result<(), SceneError> {
        let node = self.node_mut(id).ok_or(SceneError::StaleNode { node: id })?;
        node.transform = transform;
        Ok(())
    }

    fn destroy(&mut self, id: NodeId) -> Result<(), SceneError> {
        if !self.contains(id) {
            return Err(SceneError::StaleNode { node: id });
        }
        self.detach(id);
        let mut removed = 0usize;
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.take(cur) {
                removed += 1;
                stack.extend(node.children);
            }
        }
        tracing::debug!(node = %id, removed, "subtree destroyed");
        Ok(())
    }

    fn instantiate(
        &mut self,
        prefab: &str,
        parent: Option<NodeId>,
        transform: Transform,
    ) -> Result<NodeId, SceneError> {
        let mut template = self
            .prefabs
            .get(prefab)
            .cloned()
            .ok_or_else(|| SceneError::UnknownPrefab {
                prefab: prefab.to_owned(),
                registered: {
                    let mut names: Vec<&str> = self.prefabs.keys().map(String::as_str).collect();
                    names.sort_unstable();
                    names.join(", ")
                },
            })?;
        template.transform = transform;
        self.spawn(&template, parent)
    }

    fn set_managed(&mut self, id: NodeId, tag: ManagedTag) -> Result<(), SceneError> {
        let node = self.node_mut(id).ok_or(SceneError::StaleNode { node: id })?;
        node.managed = Some(tag);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
