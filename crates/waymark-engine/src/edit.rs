//! Operator edits that write straight through to the store.
//!
//! [`EditRecorder`] turns an operator action on the live scene into record
//! changes: moving a node updates its record, destroying a node marks its
//! record destroyed (or drops it, if Waymark spawned the node), and spawning a
//! prefab creates a managed node with a spawned record. Persisting is left to
//! the caller.

use waymark_scene::identity::{IdentityGenerator, NodeIdentity};
use waymark_scene::node::NodeId;
use waymark_scene::transform::Transform;
use waymark_scene::tree::{ManagedTag, SceneGraph};
use waymark_store::database::{MatchKind, SceneDatabase};
use waymark_store::record::BakedRecord;

use crate::bake::snapshot_record;
use crate::EditError;

/// Records operator edits into a [`SceneDatabase`].
pub struct EditRecorder<'a> {
    store: &'a mut SceneDatabase,
    ids: &'a dyn IdentityGenerator,
}

impl<'a> EditRecorder<'a> {
    pub fn new(store: &'a mut SceneDatabase, ids: &'a dyn IdentityGenerator) -> Self {
        Self { store, ids }
    }

    /// Store the node's current local transform. Creates a native record if
    /// the node has none yet. Returns the record key.
    pub fn record_transform(
        &mut self,
        scene: &dyn SceneGraph,
        node: NodeId,
    ) -> Result<String, EditError> {
        let fresh = snapshot_record(scene, self.ids, node).ok_or(EditError::StaleNode { node })?;
        let record = match self.existing(scene, node, &fresh) {
            Some(mut record) => {
                record.set_transform(fresh.transform());
                record
            }
            None => fresh,
        };
        let key = record.unique_id.clone();
        tracing::debug!(%key, path = %record.item_path, "transform recorded");
        self.store.upsert_record(record)?;
        Ok(key)
    }

    /// Destroy `node` and its subtree, recording the intent.
    ///
    /// Native records in the subtree are marked destroyed; spawned records are
    /// removed outright, since there is nothing to re-create. A native root
    /// without a record gets one. Returns the root's record key, if it has one.
    pub fn record_destroy(
        &mut self,
        scene: &mut dyn SceneGraph,
        node: NodeId,
    ) -> Result<Option<String>, EditError> {
        if !scene.contains(node) {
            return Err(EditError::StaleNode { node });
        }

        let mut root_key = None;
        for (depth, id) in subtree(&*scene, node).into_iter().enumerate() {
            let Some(fresh) = snapshot_record(&*scene, self.ids, id) else {
                continue;
            };
            let key = match self.existing(&*scene, id, &fresh) {
                Some(record) if record.is_spawned => {
                    self.store.remove_record(&record.scene_name, &record.unique_id)?;
                    None
                }
                Some(record) => {
                    let key = record.unique_id.clone();
                    self.store.upsert_record(record.destroyed())?;
                    Some(key)
                }
                // Only the node the operator picked gets a new record.
                None if depth == 0 && !fresh.is_spawned => {
                    let key = fresh.unique_id.clone();
                    self.store.upsert_record(fresh.destroyed())?;
                    Some(key)
                }
                None => None,
            };
            if depth == 0 {
                root_key = key;
            }
        }

        scene.destroy(node)?;
        tracing::info!(node = %node, key = ?root_key, "destroy recorded");
        Ok(root_key)
    }

    /// Instantiate `prefab`, tag the new node as managed, and record it as
    /// spawned. Returns the node and its record key.
    pub fn spawn(
        &mut self,
        scene: &mut dyn SceneGraph,
        prefab: &str,
        parent: Option<NodeId>,
        transform: Transform,
    ) -> Result<(NodeId, String), EditError> {
        let id = scene.instantiate(prefab, parent, transform)?;
        let identity = self.ids.identify(&*scene, id);
        let key = self.free_key(scene.scene_name(), &identity.unique_id);
        scene.set_managed(
            id,
            ManagedTag {
                record_key: key.clone(),
                prefab_path: prefab.to_owned(),
            },
        )?;
        let record = snapshot_record(&*scene, self.ids, id).ok_or(EditError::StaleNode { node: id })?;
        self.store.upsert_record(record)?;
        tracing::info!(%key, prefab, node = %id, "spawn recorded");
        Ok((id, key))
    }

    // -- helpers ------------------------------------------------------------

    /// The record already describing `node`, if any.
    ///
    /// A path or primary-key hit is trusted. A secondary fingerprint hit only
    /// counts when no other live node still sits at the record's path; that
    /// record belongs to the other node.
    fn existing(
        &self,
        scene: &dyn SceneGraph,
        node: NodeId,
        fresh: &BakedRecord,
    ) -> Option<BakedRecord> {
        let managed = scene.node(node).and_then(|n| n.managed.as_ref());
        if managed.is_some() {
            return self.store.get_record(&fresh.scene_name, &fresh.unique_id).cloned();
        }
        let identity = NodeIdentity {
            item_path: fresh.item_path.clone(),
            path_id: fresh.path_id.clone(),
            item_id: fresh.item_id.clone(),
            unique_id: fresh.unique_id.clone(),
        };
        let resolved = self.store.resolve(&fresh.scene_name, &identity)?;
        if matches!(resolved.matched_by, MatchKind::PathId | MatchKind::ItemId)
            && scene
                .find_by_path(&resolved.record.item_path)
                .is_some_and(|owner| owner != node)
        {
            tracing::debug!(
                node = %node,
                other = %resolved.record.item_path,
                matched_by = ?resolved.matched_by,
                "fingerprint match belongs to another live node"
            );
            return None;
        }
        Some(resolved.record.clone())
    }

    /// A spawn key not yet used in the scene's partition.
    fn free_key(&self, scene: &str, base: &str) -> String {
        let base = format!("spawn-{base}");
        let mut key = base.clone();
        let mut n = 1;
        while self.store.get_record(scene, &key).is_some() {
            key = format!("{base}-{n}");
            n += 1;
        }
        key
    }
}

/// `root` and its descendants in pre-order.
fn subtree(scene: &dyn SceneGraph, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if scene.contains(id) {
            out.push(id);
            stack.extend(scene.children(id).iter().rev().copied());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use waymark_scene::prelude::*;

    fn yard() -> SceneTree {
        let mut scene = SceneTree::new("Yard");
        scene
            .spawn(
                &NodeTemplate::new("Shed")
                    .with(Component::renderer("mesh/shed"))
                    .child(NodeTemplate::new("Door").with(Component::collider())),
                None,
            )
            .unwrap();
        scene.register_prefab(
            "prefabs/barrel",
            NodeTemplate::new("Barrel").with(Component::renderer("mesh/barrel")),
        );
        scene
    }

    #[test]
    fn move_updates_existing_record() {
        let mut scene = yard();
        let mut store = SceneDatabase::in_memory();
        let ids = HierarchyIdentity::new();
        let shed = scene.find_by_path("Shed").unwrap();

        let key = EditRecorder::new(&mut store, &ids).record_transform(&scene, shed).unwrap();
        scene
            .set_local_transform(shed, Transform::from_position(Vec3::new(3.0, 0.0, 0.0)))
            .unwrap();
        let again = EditRecorder::new(&mut store, &ids).record_transform(&scene, shed).unwrap();

        assert_eq!(key, again);
        assert_eq!(store.partition("Yard").unwrap().len(), 1);
        assert_eq!(store.get_record("Yard", &key).unwrap().position.x, 3.0);
    }

    #[test]
    fn destroy_marks_subtree_records() {
        let mut scene = yard();
        let mut store = SceneDatabase::in_memory();
        let ids = HierarchyIdentity::new();
        let door = scene.find_by_path("Shed/Door").unwrap();
        let door_key = EditRecorder::new(&mut store, &ids).record_transform(&scene, door).unwrap();

        let shed = scene.find_by_path("Shed").unwrap();
        let shed_key = EditRecorder::new(&mut store, &ids)
            .record_destroy(&mut scene, shed)
            .unwrap()
            .unwrap();

        assert!(scene.is_empty());
        assert!(store.get_record("Yard", &shed_key).unwrap().is_destroyed);
        assert!(store.get_record("Yard", &door_key).unwrap().is_destroyed);
    }

    #[test]
    fn spawn_then_destroy_leaves_no_record() {
        let mut scene = yard();
        let mut store = SceneDatabase::in_memory();
        let ids = HierarchyIdentity::new();
        let shed = scene.find_by_path("Shed").unwrap();

        let (barrel, key) = EditRecorder::new(&mut store, &ids)
            .spawn(&mut scene, "prefabs/barrel", Some(shed), Transform::IDENTITY)
            .unwrap();
        let record = store.get_record("Yard", &key).unwrap();
        assert!(record.is_spawned);
        assert_eq!(record.parent_path, "Shed");
        assert_eq!(scene.node(barrel).unwrap().managed.as_ref().unwrap().record_key, key);

        let removed = EditRecorder::new(&mut store, &ids)
            .record_destroy(&mut scene, barrel)
            .unwrap();
        assert_eq!(removed, None);
        assert!(store.get_record("Yard", &key).is_none());
        assert!(!scene.contains(barrel));
    }

    #[test]
    fn spawn_keys_do_not_collide() {
        let mut scene = yard();
        let mut store = SceneDatabase::in_memory();
        let ids = HierarchyIdentity::new();
        let mut recorder = EditRecorder::new(&mut store, &ids);

        let (first, first_key) = recorder
            .spawn(&mut scene, "prefabs/barrel", None, Transform::IDENTITY)
            .unwrap();
        // Destroying the managed root frees its slot; the replacement lands on
        // the same sibling index and hence the same identity.
        scene.destroy(first).unwrap();
        let (_, second_key) = recorder
            .spawn(&mut scene, "prefabs/barrel", None, Transform::IDENTITY)
            .unwrap();
        assert_ne!(first_key, second_key);
    }

    #[test]
    fn stale_node_is_an_error() {
        let mut scene = yard();
        let mut store = SceneDatabase::in_memory();
        let ids = HierarchyIdentity::new();
        let shed = scene.find_by_path("Shed").unwrap();
        scene.destroy(shed).unwrap();
        let mut recorder = EditRecorder::new(&mut store, &ids);
        assert!(matches!(
            recorder.record_transform(&scene, shed),
            Err(EditError::StaleNode { .. })
        ));
        assert!(matches!(
            recorder.record_destroy(&mut scene, shed),
            Err(EditError::StaleNode { .. })
        ));
    }
}
