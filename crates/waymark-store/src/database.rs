//! The persistent two-level store: `scene name -> (unique id -> BakedRecord)`.
//!
//! Each scene's records live in a [`Partition`] that also maintains secondary
//! indices on item path, path id, and item id. Those indices back the lookup
//! fallback order used by the bake and apply layers:
//!
//! 1. **path** -- exact `item_path` match. Cheap and correct for an unmoved
//!    hierarchy.
//! 2. **identity** -- `unique_id` key, then `path_id`, then `item_id`. The
//!    recovery path when an object moved but is logically the same.
//!
//! Path always wins over identity when both match different records.
//! Secondary keys are only trusted when they are unambiguous.
//!
//! # Example
//!
//! ```
//! use waymark_store::prelude::*;
//! use waymark_scene::prelude::*;
//!
//! let mut db = SceneDatabase::in_memory();
//! let identity = NodeIdentity {
//!     item_path: "Line/Press".to_owned(),
//!     path_id: "p1".to_owned(),
//!     item_id: "i1".to_owned(),
//!     unique_id: "u1".to_owned(),
//! };
//! let record = BakedRecord::from_identity("Factory", &identity, Transform::IDENTITY, "Line", vec![]);
//! db.merge_partition("Factory", vec![record]).unwrap();
//!
//! assert!(db.is_scene_baked("Factory"));
//! assert_eq!(db.lookup_by_path("Factory", "Line/Press").map(|r| r.key()), Some("u1"));
//! assert_eq!(db.lookup_by_id("Factory", "i1").map(|r| r.key()), Some("u1"));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use waymark_scene::identity::NodeIdentity;

use crate::backend::{MemoryBackend, StoreBackend};
use crate::record::BakedRecord;
use crate::StoreError;

/// Format tag written into every store envelope.
pub const STORE_FORMAT: &str = "waymark.store";
/// Current envelope version.
pub const STORE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// All records of one scene plus lookup indices.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    records: BTreeMap<String, BakedRecord>,
    by_path: HashMap<String, BTreeSet<String>>,
    by_path_id: HashMap<String, BTreeSet<String>>,
    by_item_id: HashMap<String, BTreeSet<String>>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&BakedRecord> {
        self.records.get(key)
    }

    /// Records in key order.
    pub fn records(&self) -> &BTreeMap<String, BakedRecord> {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &BakedRecord> {
        self.records.values()
    }

    /// Keys of every record whose `item_path` equals `path`.
    pub fn keys_at_path(&self, path: &str) -> impl Iterator<Item = &str> {
        self.by_path
            .get(path)
            .into_iter()
            .flat_map(|keys| keys.iter().map(String::as_str))
    }

    /// Insert or overwrite by key. Returns the previous record.
    ///
    /// Callers validate first; the partition only maintains indices.
    fn insert(&mut self, record: BakedRecord) -> Option<BakedRecord> {
        let previous = self.remove(&record.unique_id);
        let key = record.unique_id.clone();
        index_add(&mut self.by_path, &record.item_path, &key);
        index_add(&mut self.by_path_id, &record.path_id, &key);
        index_add(&mut self.by_item_id, &record.item_id, &key);
        self.records.insert(key, record);
        previous
    }

    fn remove(&mut self, key: &str) -> Option<BakedRecord> {
        let record = self.records.remove(key)?;
        index_remove(&mut self.by_path, &record.item_path, key);
        index_remove(&mut self.by_path_id, &record.path_id, key);
        index_remove(&mut self.by_item_id, &record.item_id, key);
        Some(record)
    }

    /// The single unclaimed record behind `value` in `index`, if exactly one.
    fn unambiguous<'a>(
        &'a self,
        index: &'a HashMap<String, BTreeSet<String>>,
        value: &str,
        is_claimed: &dyn Fn(&str) -> bool,
    ) -> Option<&'a BakedRecord> {
        if value.is_empty() {
            return None;
        }
        let mut open = index
            .get(value)?
            .iter()
            .filter(|k| !is_claimed(k.as_str()));
        let only = open.next()?;
        if open.next().is_some() {
            return None;
        }
        self.records.get(only)
    }
}

fn index_add(index: &mut HashMap<String, BTreeSet<String>>, value: &str, key: &str) {
    if value.is_empty() {
        return;
    }
    index
        .entry(value.to_owned())
        .or_default()
        .insert(key.to_owned());
}

fn index_remove(index: &mut HashMap<String, BTreeSet<String>>, value: &str, key: &str) {
    if let Some(keys) = index.get_mut(value) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(value);
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Which key produced a [`Resolved`] match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchKind {
    Path,
    UniqueId,
    PathId,
    ItemId,
}

impl MatchKind {
    /// `true` for the identity fallbacks (everything but a path hit).
    pub fn is_identity(self) -> bool {
        !matches!(self, MatchKind::Path)
    }
}

/// A record found for a live node, and how it was found.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub record: &'a BakedRecord,
    pub matched_by: MatchKind,
}

/// Counts from a [`SceneDatabase::merge_partition`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub overwritten: usize,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoreEnvelope {
    format: String,
    version: u32,
    /// BLAKE3 hex digest of the serialized `scenes` map. Detects truncation
    /// and bit rot; it is not a signature.
    checksum: String,
    scenes: BTreeMap<String, BTreeMap<String, BakedRecord>>,
}

fn checksum(scenes: &BTreeMap<String, BTreeMap<String, BakedRecord>>) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(scenes)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

// ---------------------------------------------------------------------------
// SceneDatabase
// ---------------------------------------------------------------------------

/// The durable store of Baked Records, partitioned by scene name.
///
/// Partitions are created lazily on the first write for a scene and are never
/// dropped implicitly. Bulk writes merge; they never replace a partition
/// unless [`replace_partition`](Self::replace_partition) is called explicitly.
pub struct SceneDatabase {
    partitions: BTreeMap<String, Partition>,
    backend: Box<dyn StoreBackend>,
    dirty: bool,
}

impl std::fmt::Debug for SceneDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneDatabase")
            .field("backend", &self.backend.describe())
            .field("scenes", &self.partitions.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl SceneDatabase {
    /// Open the store held by `backend`, or start empty if it has never been
    /// saved.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, unparseable content, an unknown format/version, a
    /// checksum mismatch, or any record that violates its invariants. Nothing
    /// is partially loaded.
    pub fn open(backend: Box<dyn StoreBackend>) -> Result<Self, StoreError> {
        let mut db = Self {
            partitions: BTreeMap::new(),
            backend,
            dirty: false,
        };
        let Some(bytes) = db.backend.load_raw()? else {
            tracing::info!(store = %db.backend.describe(), "no existing store, starting empty");
            return Ok(db);
        };

        let envelope: StoreEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.format != STORE_FORMAT || envelope.version != STORE_VERSION {
            return Err(StoreError::UnsupportedFormat {
                format: envelope.format,
                version: envelope.version,
            });
        }
        let computed = checksum(&envelope.scenes)?;
        if computed != envelope.checksum {
            return Err(StoreError::ChecksumMismatch {
                recorded: envelope.checksum,
                computed,
            });
        }

        let mut total = 0;
        for (scene, records) in envelope.scenes {
            let partition = build_partition(&scene, records)?;
            total += partition.len();
            db.partitions.insert(scene, partition);
        }
        tracing::info!(
            store = %db.backend.describe(),
            scenes = db.partitions.len(),
            records = total,
            "store loaded"
        );
        Ok(db)
    }

    /// An empty store backed by a private [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self {
            partitions: BTreeMap::new(),
            backend: Box::new(MemoryBackend::new()),
            dirty: false,
        }
    }

    /// `true` if there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// `true` once any record has been written for `scene`.
    pub fn is_scene_baked(&self, scene: &str) -> bool {
        self.partitions.get(scene).is_some_and(|p| !p.is_empty())
    }

    pub fn scene_names(&self) -> impl Iterator<Item = &str> {
        self.partitions.keys().map(String::as_str)
    }

    pub fn partition(&self, scene: &str) -> Option<&Partition> {
        self.partitions.get(scene)
    }

    pub fn get_record(&self, scene: &str, key: &str) -> Option<&BakedRecord> {
        self.partitions.get(scene)?.get(key)
    }

    /// Exact `item_path` match. `None` when absent or when several records
    /// share the path.
    pub fn lookup_by_path(&self, scene: &str, path: &str) -> Option<&BakedRecord> {
        let partition = self.partitions.get(scene)?;
        partition.unambiguous(&partition.by_path, path, &|_| false)
    }

    /// Exact `unique_id` key, then an unambiguous `path_id` or `item_id` match.
    pub fn lookup_by_id(&self, scene: &str, identity: &str) -> Option<&BakedRecord> {
        let partition = self.partitions.get(scene)?;
        partition.get(identity).or_else(|| {
            partition
                .unambiguous(&partition.by_path_id, identity, &|_| false)
                .or_else(|| partition.unambiguous(&partition.by_item_id, identity, &|_| false))
        })
    }

    /// Resolve a live node's identity with the path-first fallback order.
    pub fn resolve(&self, scene: &str, identity: &NodeIdentity) -> Option<Resolved<'_>> {
        self.resolve_unclaimed(scene, identity, &|_| false)
    }

    /// Like [`resolve`](Self::resolve), skipping records for which
    /// `is_claimed` returns `true` (already matched to another live node).
    pub fn resolve_unclaimed(
        &self,
        scene: &str,
        identity: &NodeIdentity,
        is_claimed: &dyn Fn(&str) -> bool,
    ) -> Option<Resolved<'_>> {
        let partition = self.partitions.get(scene)?;
        if identity.is_empty() {
            return None;
        }

        // 1. Path. Several records on one path are told apart by unique id.
        let at_path: Vec<&str> = partition
            .keys_at_path(&identity.item_path)
            .filter(|k| !is_claimed(*k))
            .collect();
        let path_hit = match at_path.as_slice() {
            [only] => Some(*only),
            [] => None,
            many => many.iter().copied().find(|k| *k == identity.unique_id),
        };
        if let Some(record) = path_hit.and_then(|k| partition.get(k)) {
            return Some(Resolved {
                record,
                matched_by: MatchKind::Path,
            });
        }

        // 2. Identity: primary key, then the secondary fingerprints.
        if let Some(record) = partition
            .get(&identity.unique_id)
            .filter(|r| !is_claimed(r.unique_id.as_str()))
        {
            return Some(Resolved {
                record,
                matched_by: MatchKind::UniqueId,
            });
        }
        if let Some(record) = partition.unambiguous(&partition.by_path_id, &identity.path_id, is_claimed) {
            return Some(Resolved {
                record,
                matched_by: MatchKind::PathId,
            });
        }
        partition
            .unambiguous(&partition.by_item_id, &identity.item_id, is_claimed)
            .map(|record| Resolved {
                record,
                matched_by: MatchKind::ItemId,
            })
    }

    /// Insert-or-overwrite `records` into `scene`'s partition; records with
    /// other keys are preserved.
    ///
    /// # Errors
    ///
    /// Every record is validated before anything is written; on error the
    /// partition is unchanged.
    pub fn merge_partition(
        &mut self,
        scene: &str,
        records: impl IntoIterator<Item = BakedRecord>,
    ) -> Result<MergeSummary, StoreError> {
        let records: Vec<BakedRecord> = records.into_iter().collect();
        for record in &records {
            check_record(scene, &record.unique_id, record)?;
        }
        let partition = self.partitions.entry(scene.to_owned()).or_default();
        let mut summary = MergeSummary::default();
        for record in records {
            match partition.insert(record) {
                Some(_) => summary.overwritten += 1,
                None => summary.inserted += 1,
            }
        }
        self.dirty = true;
        tracing::debug!(
            scene,
            inserted = summary.inserted,
            overwritten = summary.overwritten,
            "partition merged"
        );
        Ok(summary)
    }

    /// Replace `scene`'s partition wholesale.
    pub fn replace_partition(
        &mut self,
        scene: &str,
        records: BTreeMap<String, BakedRecord>,
    ) -> Result<(), StoreError> {
        let partition = build_partition(scene, records)?;
        self.partitions.insert(scene.to_owned(), partition);
        self.dirty = true;
        Ok(())
    }

    /// Insert or overwrite a single record in its own scene's partition.
    pub fn upsert_record(&mut self, record: BakedRecord) -> Result<Option<BakedRecord>, StoreError> {
        let scene = record.scene_name.clone();
        check_record(&scene, &record.unique_id, &record)?;
        self.dirty = true;
        Ok(self.partitions.entry(scene).or_default().insert(record))
    }

    /// Delete a record. This is the only way records leave the store.
    pub fn remove_record(&mut self, scene: &str, key: &str) -> Result<BakedRecord, StoreError> {
        let removed = self
            .partitions
            .get_mut(scene)
            .and_then(|p| p.remove(key))
            .ok_or_else(|| StoreError::UnknownRecord {
                scene: scene.to_owned(),
                key: key.to_owned(),
            })?;
        self.dirty = true;
        tracing::info!(scene, key, item_path = %removed.item_path, "record removed");
        Ok(removed)
    }

    /// Serialize every partition into the envelope format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let scenes: BTreeMap<String, BTreeMap<String, BakedRecord>> = self
            .partitions
            .iter()
            .map(|(name, p)| (name.clone(), p.records.clone()))
            .collect();
        let envelope = StoreEnvelope {
            format: STORE_FORMAT.to_owned(),
            version: STORE_VERSION,
            checksum: checksum(&scenes)?,
            scenes,
        };
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Durably write the whole store. Last successful full write wins.
    pub fn persist(&mut self) -> Result<(), StoreError> {
        let bytes = self.to_bytes()?;
        self.backend.save_raw(&bytes)?;
        self.dirty = false;
        tracing::info!(
            store = %self.backend.describe(),
            scenes = self.partitions.len(),
            bytes = bytes.len(),
            "store persisted"
        );
        Ok(())
    }
}

fn check_record(scene: &str, key: &str, record: &BakedRecord) -> Result<(), StoreError> {
    record.validate().map_err(|source| StoreError::InvalidRecord {
        scene: scene.to_owned(),
        source,
    })?;
    if record.scene_name != scene {
        return Err(StoreError::Misfiled {
            scene: scene.to_owned(),
            key: key.to_owned(),
            details: format!("record belongs to scene '{}'", record.scene_name),
        });
    }
    if record.unique_id != key {
        return Err(StoreError::Misfiled {
            scene: scene.to_owned(),
            key: key.to_owned(),
            details: format!("record key is '{}'", record.unique_id),
        });
    }
    Ok(())
}

fn build_partition(
    scene: &str,
    records: BTreeMap<String, BakedRecord>,
) -> Result<Partition, StoreError> {
    let mut partition = Partition::new();
    for (key, record) in records {
        check_record(scene, &key, &record)?;
        partition.insert(record);
    }
    Ok(partition)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use waymark_scene::transform::{Transform, Vec3};

    fn identity(path: &str, unique: &str, path_id: &str, item_id: &str) -> NodeIdentity {
        NodeIdentity {
            item_path: path.to_owned(),
            path_id: path_id.to_owned(),
            item_id: item_id.to_owned(),
            unique_id: unique.to_owned(),
        }
    }

    fn record(path: &str, unique: &str, path_id: &str, item_id: &str) -> BakedRecord {
        BakedRecord::from_identity(
            "Factory",
            &identity(path, unique, path_id, item_id),
            Transform::IDENTITY,
            "",
            Vec::new(),
        )
    }

    #[test]
    fn merge_preserves_unrelated_records() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition("Factory", vec![record("A", "a", "pa", "ia"), record("B", "b", "pb", "ib")])
            .unwrap();

        let mut moved = record("A", "a", "pa", "ia");
        moved.position = Vec3::new(5.0, 0.0, 0.0);
        let summary = db
            .merge_partition("Factory", vec![moved, record("C", "c", "pc", "ic")])
            .unwrap();

        assert_eq!(summary, MergeSummary { inserted: 1, overwritten: 1 });
        let p = db.partition("Factory").unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.get("a").unwrap().position.x, 5.0);
        assert!(p.get("b").is_some());
    }

    #[test]
    fn merge_rejects_invalid_batch_atomically() {
        let mut db = SceneDatabase::in_memory();
        let bad = record("B", "b", "pb", "ib").spawned("p").destroyed();
        let err = db
            .merge_partition("Factory", vec![record("A", "a", "pa", "ia"), bad])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
        assert!(!db.is_scene_baked("Factory"));
    }

    #[test]
    fn merge_rejects_record_for_other_scene() {
        let mut db = SceneDatabase::in_memory();
        let err = db
            .merge_partition("Warehouse", vec![record("A", "a", "pa", "ia")])
            .unwrap_err();
        assert!(matches!(err, StoreError::Misfiled { .. }));
    }

    #[test]
    fn overwrite_reindexes_secondary_keys() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition("Factory", vec![record("Old/Path", "a", "pa", "ia")])
            .unwrap();
        db.merge_partition("Factory", vec![record("New/Path", "a", "pa2", "ia")])
            .unwrap();
        assert!(db.lookup_by_path("Factory", "Old/Path").is_none());
        assert_eq!(db.lookup_by_path("Factory", "New/Path").unwrap().key(), "a");
        assert!(db.lookup_by_id("Factory", "pa").is_none());
        assert_eq!(db.lookup_by_id("Factory", "pa2").unwrap().key(), "a");
    }

    #[test]
    fn ambiguous_path_is_not_a_hit() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition(
            "Factory",
            vec![record("Hall/Belt", "a", "pa", "ib"), record("Hall/Belt", "b", "pb", "ib")],
        )
        .unwrap();
        assert!(db.lookup_by_path("Factory", "Hall/Belt").is_none());
        // Ambiguous path disambiguated by unique id during resolve.
        let r = db
            .resolve("Factory", &identity("Hall/Belt", "b", "zz", "ib"))
            .unwrap();
        assert_eq!(r.record.key(), "b");
        assert_eq!(r.matched_by, MatchKind::Path);
        // Shared item id is never trusted.
        assert!(db.lookup_by_id("Factory", "ib").is_none());
    }

    #[test]
    fn path_beats_identity_on_conflict() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition(
            "Factory",
            vec![record("Line/Press", "stale", "p1", "i1"), record("Yard/Press", "fresh", "p2", "i2")],
        )
        .unwrap();
        // Live node sits at Line/Press but its unique id matches the other record.
        let live = identity("Line/Press", "fresh", "p9", "i9");
        let r = db.resolve("Factory", &live).unwrap();
        assert_eq!(r.record.key(), "stale");
        assert_eq!(r.matched_by, MatchKind::Path);
    }

    #[test]
    fn identity_fallback_order() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition("Factory", vec![record("Line/Press", "u1", "p1", "i1")])
            .unwrap();

        let by_unique = db.resolve("Factory", &identity("Moved/Press", "u1", "x", "y")).unwrap();
        assert_eq!(by_unique.matched_by, MatchKind::UniqueId);

        let by_path_id = db.resolve("Factory", &identity("Renamed", "zz", "p1", "y")).unwrap();
        assert_eq!(by_path_id.matched_by, MatchKind::PathId);

        let by_item = db.resolve("Factory", &identity("Else/Where", "zz", "x", "i1")).unwrap();
        assert_eq!(by_item.matched_by, MatchKind::ItemId);
        assert!(by_item.matched_by.is_identity());

        assert!(db.resolve("Factory", &identity("No", "no", "no", "no")).is_none());
        assert!(db.resolve("Factory", &NodeIdentity::empty()).is_none());
    }

    #[test]
    fn claimed_records_are_skipped() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition("Factory", vec![record("Line/Press", "u1", "p1", "i1")])
            .unwrap();
        let live = identity("Line/Press", "u1", "p1", "i1");
        assert!(db.resolve_unclaimed("Factory", &live, &|k| k == "u1").is_none());
    }

    #[test]
    fn remove_is_explicit() {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition("Factory", vec![record("A", "a", "pa", "ia")]).unwrap();
        assert!(matches!(
            db.remove_record("Factory", "zz"),
            Err(StoreError::UnknownRecord { .. })
        ));
        db.remove_record("Factory", "a").unwrap();
        assert!(!db.is_scene_baked("Factory"));
        // Partition survives, empty.
        assert!(db.partition("Factory").is_some());
    }

    #[test]
    fn persist_and_reopen_roundtrip() {
        let backend = MemoryBackend::new();
        let mut db = SceneDatabase::open(Box::new(backend.clone())).unwrap();
        let mut r = record("A/B", "ab", "pab", "iab").spawned("props/b");
        r.parent_path = "A".to_owned();
        r.rotation = Vec3::new(0.0, 90.0, 0.0);
        db.upsert_record(r.clone()).unwrap();
        assert!(db.is_dirty());
        db.persist().unwrap();
        assert!(!db.is_dirty());

        let reopened = SceneDatabase::open(Box::new(backend)).unwrap();
        assert_eq!(reopened.get_record("Factory", "ab"), Some(&r));
    }

    #[test]
    fn corrupted_store_is_rejected() {
        let backend = MemoryBackend::new();
        let mut db = SceneDatabase::open(Box::new(backend.clone())).unwrap();
        db.upsert_record(record("A", "a", "pa", "ia")).unwrap();
        db.persist().unwrap();

        let text = String::from_utf8(backend.contents().unwrap()).unwrap();
        backend.set_contents(text.replace("\"A\"", "\"Z\"").into_bytes());
        let err = SceneDatabase::open(Box::new(backend)).unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }
}
