//! The Baked Record: one persisted fact about one scene object.

use serde::{Deserialize, Serialize};

use waymark_scene::identity::NodeIdentity;
use waymark_scene::transform::{Transform, Vec3};

// ---------------------------------------------------------------------------
// RecordError
// ---------------------------------------------------------------------------

/// Structural invariant violations of a [`BakedRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record has an empty unique id (item path '{item_path}')")]
    EmptyKey { item_path: String },

    /// Destruction intent only applies to native objects, spawn intent only to
    /// created ones; both at once is meaningless.
    #[error("record '{unique_id}' is marked both destroyed and spawned")]
    DestroyedAndSpawned { unique_id: String },

    #[error("spawned record '{unique_id}' has no prefab path")]
    MissingPrefab { unique_id: String },

    #[error("record '{unique_id}' lists child '{child}' outside its own path '{item_path}'")]
    ChildOutsidePath {
        unique_id: String,
        child: String,
        item_path: String,
    },
}

// ---------------------------------------------------------------------------
// BakedRecord
// ---------------------------------------------------------------------------

/// Persisted identity, transform snapshot and lifecycle intent of one object.
///
/// Field names on disk follow the host's conventions (`UniqueId`, `PathID`,
/// ...), so stores written by other tooling read back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BakedRecord {
    /// Primary key within the scene partition.
    pub unique_id: String,
    #[serde(rename = "PathID")]
    pub path_id: String,
    #[serde(rename = "ItemID")]
    pub item_id: String,
    /// Full hierarchical path at bake time.
    pub item_path: String,
    pub scene_name: String,
    pub position: Vec3,
    /// Euler angles, degrees.
    pub rotation: Vec3,
    pub scale: Vec3,
    /// Path of the parent at bake time; empty for roots.
    #[serde(default)]
    pub parent_path: String,
    #[serde(default)]
    pub is_destroyed: bool,
    #[serde(default)]
    pub is_spawned: bool,
    #[serde(default)]
    pub prefab_path: String,
    #[serde(default)]
    pub children: Vec<String>,
}

impl BakedRecord {
    /// A record for a native (not spawned, not destroyed) object.
    pub fn from_identity(
        scene_name: impl Into<String>,
        identity: &NodeIdentity,
        transform: Transform,
        parent_path: impl Into<String>,
        children: Vec<String>,
    ) -> Self {
        Self {
            unique_id: identity.unique_id.clone(),
            path_id: identity.path_id.clone(),
            item_id: identity.item_id.clone(),
            item_path: identity.item_path.clone(),
            scene_name: scene_name.into(),
            position: transform.position,
            rotation: transform.rotation,
            scale: transform.scale,
            parent_path: parent_path.into(),
            is_destroyed: false,
            is_spawned: false,
            prefab_path: String::new(),
            children,
        }
    }

    /// Mark as created from `prefab_path` rather than native to the scene.
    pub fn spawned(mut self, prefab_path: impl Into<String>) -> Self {
        self.is_spawned = true;
        self.prefab_path = prefab_path.into();
        self
    }

    /// Mark for removal on load.
    pub fn destroyed(mut self) -> Self {
        self.is_destroyed = true;
        self
    }

    /// The partition key.
    pub fn key(&self) -> &str {
        &self.unique_id
    }

    pub fn transform(&self) -> Transform {
        Transform {
            position: self.position,
            rotation: self.rotation,
            scale: self.scale,
        }
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.position = transform.position;
        self.rotation = transform.rotation;
        self.scale = transform.scale;
    }

    /// Check the record's structural invariants.
    ///
    /// Every store write calls this; an invalid record never reaches a
    /// partition.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.unique_id.is_empty() {
            return Err(RecordError::EmptyKey {
                item_path: self.item_path.clone(),
            });
        }
        if self.is_destroyed && self.is_spawned {
            return Err(RecordError::DestroyedAndSpawned {
                unique_id: self.unique_id.clone(),
            });
        }
        if self.is_spawned && self.prefab_path.is_empty() {
            return Err(RecordError::MissingPrefab {
                unique_id: self.unique_id.clone(),
            });
        }
        let prefix = format!("{}/", self.item_path);
        if let Some(child) = self.children.iter().find(|c| !c.starts_with(&prefix)) {
            return Err(RecordError::ChildOutsidePath {
                unique_id: self.unique_id.clone(),
                child: child.clone(),
                item_path: self.item_path.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
