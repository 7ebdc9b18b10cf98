//! Waymark Scene -- live scene abstraction and cross-session node identity.
//!
//! This crate defines everything Waymark needs to know about a host's object
//! hierarchy: the [`SceneGraph`](tree::SceneGraph) trait the host implements,
//! generational session-local [`NodeId`](node::NodeId)s, the
//! [`IdentityGenerator`](identity::IdentityGenerator) contract that turns a
//! live node into stable identity strings, and the eligibility predicate that
//! decides which nodes are tracked at all.
//!
//! [`SceneTree`](tree::SceneTree) is a complete in-memory host used by
//! headless tooling and tests.
//!
//! # Quick Start
//!
//! ```
//! use waymark_scene::prelude::*;
//!
//! let mut scene = SceneTree::new("Factory");
//! let root = scene
//!     .spawn(
//!         &NodeTemplate::new("Line")
//!             .child(NodeTemplate::new("Press").with(Component::renderer("mesh/press"))),
//!         None,
//!     )
//!     .unwrap();
//!
//! let press = scene.find_by_path("Line/Press").unwrap();
//! let identity = HierarchyIdentity::new().identify(&scene, press);
//! assert_eq!(identity.item_path, "Line/Press");
//! assert!(EligibilityRules::default().evaluate(&scene, press).is_eligible());
//! assert!(!EligibilityRules::default().evaluate(&scene, root).is_eligible());
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod eligibility;
pub mod identity;
pub mod node;
pub mod transform;
pub mod tree;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by scene mutations.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// The node does not exist (destroyed, stale generation, or never allocated).
    #[error("node {node:?} does not exist (stale or never allocated)")]
    StaleNode { node: node::NodeId },

    /// A prefab was requested that the host cannot provide (yet).
    #[error("prefab '{prefab}' is not available. Registered prefabs: [{registered}]")]
    UnknownPrefab { prefab: String, registered: String },

    /// A re-parent would break the tree.
    #[error("cannot parent node {node:?} under {parent:?}: {details}")]
    InvalidParent {
        node: node::NodeId,
        parent: node::NodeId,
        details: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{Component, ComponentKind};
    pub use crate::eligibility::{Eligibility, EligibilityRules, IgnoreReason};
    pub use crate::identity::{HierarchyIdentity, IdentityGenerator, NodeIdentity};
    pub use crate::node::NodeId;
    pub use crate::transform::{Transform, Vec3};
    pub use crate::tree::{ManagedTag, NodeTemplate, SceneGraph, SceneNode, SceneTree};
    pub use crate::SceneError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
