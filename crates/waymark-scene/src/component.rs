//! Component descriptors attached to live scene nodes.
//!
//! Waymark never owns component data; it only needs to know *what* a node
//! carries. Each [`Component`] names its type (for the diagnostics histogram),
//! a coarse [`ComponentKind`] (for the eligibility predicate) and, for render
//! components, the asset it references (for content-based identity).

use serde::{Deserialize, Serialize};

/// Coarse classification of a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Mesh/skinned/sprite renderers and friends.
    Renderer,
    /// Any physics collider.
    Collider,
    Camera,
    Light,
    /// Particle emitters. Their presence anywhere below a node disqualifies it.
    ParticleSystem,
    /// Everything else (scripts, audio, animators, ...).
    Other,
}

/// One component on a live node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Component {
    /// Host type name, e.g. `"MeshRenderer"`.
    pub type_name: String,
    pub kind: ComponentKind,
    /// Mesh/material/asset reference, when the component has one.
    pub asset_ref: Option<String>,
}

impl Component {
    pub fn new(type_name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            type_name: type_name.into(),
            kind,
            asset_ref: None,
        }
    }

    pub fn with_asset(mut self, asset_ref: impl Into<String>) -> Self {
        self.asset_ref = Some(asset_ref.into());
        self
    }

    pub fn renderer(asset_ref: impl Into<String>) -> Self {
        Self::new("MeshRenderer", ComponentKind::Renderer).with_asset(asset_ref)
    }

    pub fn collider() -> Self {
        Self::new("BoxCollider", ComponentKind::Collider)
    }

    pub fn camera() -> Self {
        Self::new("Camera", ComponentKind::Camera)
    }

    pub fn light() -> Self {
        Self::new("Light", ComponentKind::Light)
    }

    pub fn particle_system() -> Self {
        Self::new("ParticleSystem", ComponentKind::ParticleSystem)
    }

    pub fn script(type_name: impl Into<String>) -> Self {
        Self::new(type_name, ComponentKind::Other)
    }
}
