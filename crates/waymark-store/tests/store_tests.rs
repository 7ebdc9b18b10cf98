//! Integration tests for the durable store: file persistence across
//! "process restarts" and merge semantics under random batches.

use std::collections::BTreeSet;

use proptest::prelude::*;
use waymark_scene::prelude::*;
use waymark_store::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn record(scene: &str, n: u32) -> BakedRecord {
    let identity = NodeIdentity {
        item_path: format!("Hall/Item{n}"),
        path_id: format!("path-{n}"),
        item_id: format!("item-{n}"),
        unique_id: format!("uid-{n}"),
    };
    BakedRecord::from_identity(
        scene,
        &identity,
        Transform::from_position(Vec3::new(n as f32, 0.5, -(n as f32))),
        "Hall",
        vec![format!("Hall/Item{n}/Handle")],
    )
}

// ---------------------------------------------------------------------------
// File persistence
// ---------------------------------------------------------------------------

#[test]
fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("waymark_store.json");

    {
        let mut db = SceneDatabase::open(Box::new(FileBackend::new(&path))).unwrap();
        db.merge_partition("Factory", (0..10).map(|n| record("Factory", n)))
            .unwrap();
        db.merge_partition("Warehouse", (0..3).map(|n| record("Warehouse", n)))
            .unwrap();
        db.persist().unwrap();
    }

    let db = SceneDatabase::open(Box::new(FileBackend::new(&path))).unwrap();
    let scenes: Vec<&str> = db.scene_names().collect();
    assert_eq!(scenes, vec!["Factory", "Warehouse"]);
    assert_eq!(db.partition("Factory").unwrap().len(), 10);
    assert_eq!(db.get_record("Factory", "uid-7"), Some(&record("Factory", 7)));
    assert_eq!(
        db.lookup_by_path("Warehouse", "Hall/Item2").map(|r| r.key()),
        Some("uid-2")
    );
}

#[test]
fn truncated_file_fails_to_open_and_keeps_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("waymark_store.json");
    let mut db = SceneDatabase::open(Box::new(FileBackend::new(&path))).unwrap();
    db.merge_partition("Factory", (0..4).map(|n| record("Factory", n)))
        .unwrap();
    db.persist().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let err = SceneDatabase::open(Box::new(FileBackend::new(&path))).unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
}

#[test]
fn unknown_format_is_rejected() {
    let backend = MemoryBackend::new();
    backend.set_contents(
        br#"{"format":"other","version":9,"checksum":"","scenes":{}}"#.to_vec(),
    );
    let err = SceneDatabase::open(Box::new(backend)).unwrap_err();
    assert!(matches!(err, StoreError::UnsupportedFormat { version: 9, .. }));
}

#[test]
fn replace_partition_is_wholesale() {
    let mut db = SceneDatabase::in_memory();
    db.merge_partition("Factory", (0..5).map(|n| record("Factory", n)))
        .unwrap();
    let only = record("Factory", 9);
    db.replace_partition(
        "Factory",
        [(only.unique_id.clone(), only)].into_iter().collect(),
    )
    .unwrap();
    let keys: Vec<&String> = db.partition("Factory").unwrap().records().keys().collect();
    assert_eq!(keys, vec!["uid-9"]);
}

// ---------------------------------------------------------------------------
// Merge property
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Merging batch S never touches records outside S.
    #[test]
    fn merge_only_touches_its_own_keys(
        first in prop::collection::btree_set(0u32..40, 0..20),
        second in prop::collection::btree_set(0u32..40, 0..20),
    ) {
        let mut db = SceneDatabase::in_memory();
        db.merge_partition("Factory", first.iter().map(|&n| record("Factory", n))).unwrap();

        let mut moved: Vec<BakedRecord> = second.iter().map(|&n| record("Factory", n)).collect();
        for r in &mut moved {
            r.position.y = 42.0;
        }
        let summary = db.merge_partition("Factory", moved).unwrap();

        let union: BTreeSet<u32> = first.union(&second).copied().collect();
        let partition = db.partition("Factory").unwrap();
        prop_assert_eq!(partition.len(), union.len());
        prop_assert_eq!(summary.overwritten, first.intersection(&second).count());
        for n in union {
            let r = partition.get(&format!("uid-{n}")).unwrap();
            if second.contains(&n) {
                prop_assert_eq!(r.position.y, 42.0);
            } else {
                prop_assert_eq!(r, &record("Factory", n));
            }
        }
    }
}
