//! The eligibility predicate: which live nodes are worth identity tracking.
//!
//! A node is eligible iff ALL of the following hold:
//!
//! 1. it is active in the hierarchy (itself and every ancestor);
//! 2. its name does not start with the temporary prefix and is not a sentinel;
//! 3. its name does not mark it as a UI element;
//! 4. it has no camera or light, and no descendant with a particle system;
//! 5. it has a renderer or a collider.
//!
//! Baking and reconciliation share this predicate so that the set of nodes
//! written to the store is exactly the set matched back on load.

use serde::{Deserialize, Serialize};

use crate::component::ComponentKind;
use crate::node::NodeId;
use crate::tree::SceneGraph;

/// Why a node was excluded. [`EligibilityRules::evaluate`] checks in the
/// order of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Stale handle: the node was destroyed before it could be examined.
    Missing,
    Inactive,
    Temporary,
    Sentinel,
    UiElement,
    CameraOrLight,
    NoRendererOrCollider,
    ParticleDescendant,
    /// Another node in the same bake already produced a record under this
    /// key. Only the bake pass reports this.
    DuplicateKey,
}

/// Outcome of [`EligibilityRules::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ignored(IgnoreReason),
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Name-based parts of the predicate, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityRules {
    /// Names starting with this are scratch objects, e.g. `TEMP_Foo`.
    pub temp_prefix: String,
    /// Exact names of engine scaffolding objects.
    pub sentinel_names: Vec<String>,
    /// Name prefixes that mark UI elements.
    pub ui_prefixes: Vec<String>,
    /// Name substrings that mark UI elements.
    pub ui_substrings: Vec<String>,
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self {
            temp_prefix: "TEMP_".to_owned(),
            sentinel_names: vec!["__WaymarkSentinel".to_owned(), "EventSystem".to_owned()],
            ui_prefixes: vec!["UI_".to_owned(), "UI.".to_owned()],
            ui_substrings: vec!["Canvas".to_owned(), "HUD".to_owned()],
        }
    }
}

impl EligibilityRules {
    /// Apply the full predicate to a live node.
    pub fn evaluate(&self, scene: &dyn SceneGraph, id: NodeId) -> Eligibility {
        use Eligibility::Ignored;

        let Some(node) = scene.node(id) else {
            return Ignored(IgnoreReason::Missing);
        };
        if !scene.is_active_in_hierarchy(id) {
            return Ignored(IgnoreReason::Inactive);
        }
        if !self.temp_prefix.is_empty() && node.name.starts_with(&self.temp_prefix) {
            return Ignored(IgnoreReason::Temporary);
        }
        if self.sentinel_names.iter().any(|s| *s == node.name) {
            return Ignored(IgnoreReason::Sentinel);
        }
        if self.is_ui_name(&node.name) {
            return Ignored(IgnoreReason::UiElement);
        }
        if node.has_kind(ComponentKind::Camera) || node.has_kind(ComponentKind::Light) {
            return Ignored(IgnoreReason::CameraOrLight);
        }
        if !node.has_kind(ComponentKind::Renderer) && !node.has_kind(ComponentKind::Collider) {
            return Ignored(IgnoreReason::NoRendererOrCollider);
        }
        // Most expensive check last: walks the subtree.
        if scene.subtree_has_kind(id, ComponentKind::ParticleSystem) {
            return Ignored(IgnoreReason::ParticleDescendant);
        }
        Eligibility::Eligible
    }

    pub fn is_ui_name(&self, name: &str) -> bool {
        name == "UI"
            || self.ui_prefixes.iter().any(|p| name.starts_with(p.as_str()))
            || self.ui_substrings.iter().any(|s| name.contains(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::tree::{NodeTemplate, SceneTree};

    fn solid(name: &str) -> NodeTemplate {
        NodeTemplate::new(name).with(Component::renderer("mesh/box"))
    }

    fn evaluate(template: NodeTemplate) -> Eligibility {
        let mut tree = SceneTree::new("Test");
        let id = tree.spawn(&template, None).unwrap();
        EligibilityRules::default().evaluate(&tree, id)
    }

    #[test]
    fn renderer_node_is_eligible() {
        assert_eq!(evaluate(solid("Crate")), Eligibility::Eligible);
    }

    #[test]
    fn collider_without_renderer_is_eligible() {
        let t = NodeTemplate::new("Trigger").with(Component::collider());
        assert_eq!(evaluate(t), Eligibility::Eligible);
    }

    #[test]
    fn inactive_is_ignored() {
        assert_eq!(
            evaluate(solid("Crate").inactive()),
            Eligibility::Ignored(IgnoreReason::Inactive)
        );
    }

    #[test]
    fn inactive_ancestor_is_ignored() {
        let mut tree = SceneTree::new("Test");
        tree.spawn(&NodeTemplate::new("Group").inactive().child(solid("Crate")), None)
            .unwrap();
        let id = tree.find_by_path("Group/Crate").unwrap();
        assert_eq!(
            EligibilityRules::default().evaluate(&tree, id),
            Eligibility::Ignored(IgnoreReason::Inactive)
        );
    }

    #[test]
    fn temporary_and_sentinel_names_are_ignored() {
        assert_eq!(
            evaluate(solid("TEMP_Foo")),
            Eligibility::Ignored(IgnoreReason::Temporary)
        );
        assert_eq!(
            evaluate(solid("EventSystem")),
            Eligibility::Ignored(IgnoreReason::Sentinel)
        );
    }

    #[test]
    fn ui_names_are_ignored() {
        for name in ["UI", "UI_Button", "MainCanvas", "PlayerHUD"] {
            assert_eq!(
                evaluate(solid(name)),
                Eligibility::Ignored(IgnoreReason::UiElement),
                "{name}"
            );
        }
        assert_eq!(evaluate(solid("Building")), Eligibility::Eligible);
    }

    #[test]
    fn camera_and_light_are_ignored() {
        assert_eq!(
            evaluate(solid("Cam").with(Component::camera())),
            Eligibility::Ignored(IgnoreReason::CameraOrLight)
        );
        assert_eq!(
            evaluate(solid("Lamp").with(Component::light())),
            Eligibility::Ignored(IgnoreReason::CameraOrLight)
        );
    }

    #[test]
    fn particle_descendant_is_ignored() {
        let t = solid("Furnace").child(NodeTemplate::new("Smoke").with(Component::particle_system()));
        assert_eq!(
            evaluate(t),
            Eligibility::Ignored(IgnoreReason::ParticleDescendant)
        );
    }

    #[test]
    fn bare_node_is_ignored() {
        let t = NodeTemplate::new("Empty").with(Component::script("Spinner"));
        assert_eq!(
            evaluate(t),
            Eligibility::Ignored(IgnoreReason::NoRendererOrCollider)
        );
    }

    #[test]
    fn stale_handle_is_missing() {
        let mut tree = SceneTree::new("Test");
        let id = tree.spawn(&solid("Crate"), None).unwrap();
        tree.destroy(id).unwrap();
        assert_eq!(
            EligibilityRules::default().evaluate(&tree, id),
            Eligibility::Ignored(IgnoreReason::Missing)
        );
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let rules: EligibilityRules = serde_json::from_str(r#"{"temp_prefix": "TMP_"}"#).unwrap();
        assert_eq!(rules.temp_prefix, "TMP_");
        assert_eq!(rules.ui_prefixes, EligibilityRules::default().ui_prefixes);
    }
}
