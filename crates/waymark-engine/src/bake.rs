//! The bake pass: snapshot every eligible live node into the store.
//!
//! A [`Baker`] is a small state machine driven by [`Baker::step`]:
//!
//! 1. **Analyzing** counts every reachable node and builds a histogram of
//!    component type names.
//! 2. **Walking** visits the nodes again, runs the eligibility predicate, and
//!    builds a [`BakedRecord`] for each eligible or Store-managed node.
//! 3. **Saving** merges the records into the scene's partition and persists the
//!    store.
//!
//! Each step processes at most `step_budget` nodes from an explicit depth-first
//! work queue and then hands control back, so a host can bake a large scene
//! while keeping its frame loop responsive.
//!
//! # Example
//!
//! ```
//! use waymark_engine::bake::{BakeStep, Baker};
//! use waymark_engine::diagnostics::Diagnostics;
//! use waymark_engine::prelude::*;
//!
//! let mut scene = SceneTree::new("Factory");
//! scene
//!     .spawn(&NodeTemplate::new("Press").with(Component::collider()), None)
//!     .unwrap();
//! let mut store = SceneDatabase::in_memory();
//! let mut diagnostics = Diagnostics::new();
//!
//! let mut baker = Baker::new(8, EligibilityRules::default());
//! baker.start_baking(&scene, Some(&store)).unwrap();
//! let report = loop {
//!     match baker
//!         .step(&scene, &HierarchyIdentity::new(), Some(&mut store), &mut diagnostics)
//!         .unwrap()
//!     {
//!         BakeStep::Finished(report) => break report,
//!         _ => continue,
//!     }
//! };
//! assert_eq!(report.baked, 1);
//! assert!(store.lookup_by_path("Factory", "Press").is_some());
//! ```

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use waymark_scene::eligibility::{Eligibility, EligibilityRules, IgnoreReason};
use waymark_scene::identity::IdentityGenerator;
use waymark_scene::node::NodeId;
use waymark_scene::tree::SceneGraph;
use waymark_store::database::{MergeSummary, SceneDatabase};
use waymark_store::record::BakedRecord;

use crate::diagnostics::{DiagnosticsSink, Phase};
use crate::BakeError;

/// Share of the progress bar owned by each phase.
const ANALYZE_SHARE: f32 = 0.1;
const WALK_SHARE: f32 = 0.8;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BakePhase {
    Idle,
    Analyzing,
    Walking,
    Saving,
}

/// Outcome of one [`Baker::step`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum BakeStep {
    /// No bake is running.
    Idle,
    /// Work remains; carries the current progress fraction.
    InProgress(f32),
    Finished(BakeReport),
}

/// Summary of a completed bake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BakeReport {
    pub scene_name: String,
    /// Nodes counted during analysis.
    pub total_nodes: usize,
    pub baked: usize,
    pub ignored: usize,
    pub ignore_reasons: BTreeMap<IgnoreReason, usize>,
    /// Component type name -> occurrences.
    pub histogram: BTreeMap<String, usize>,
    pub merge: MergeSummary,
    /// `false` when the records were merged but writing the store failed.
    pub persisted: bool,
}

/// What a GUI needs to draw the bake panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BakeStatus {
    pub phase: BakePhase,
    pub progress: f32,
    pub status_text: String,
    pub total_nodes: usize,
    pub processed: usize,
    pub baked: usize,
    pub ignored: usize,
    pub histogram: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Record snapshot
// ---------------------------------------------------------------------------

/// Build the record that describes `node` as it is right now.
///
/// Store-managed nodes are recorded under their managed key as spawned from
/// their prefab. Returns `None` for a stale handle.
pub fn snapshot_record(
    scene: &dyn SceneGraph,
    ids: &dyn IdentityGenerator,
    node: NodeId,
) -> Option<BakedRecord> {
    let live = scene.node(node)?;
    let identity = ids.identify(scene, node);
    if identity.is_empty() {
        return None;
    }
    let parent_path = live
        .parent
        .and_then(|p| scene.path_of(p))
        .unwrap_or_default();
    let children = live
        .children
        .iter()
        .filter_map(|&c| scene.node(c))
        .map(|c| format!("{}/{}", identity.item_path, c.name))
        .collect();

    let mut record = BakedRecord::from_identity(
        scene.scene_name(),
        &identity,
        live.transform,
        parent_path,
        children,
    );
    if let Some(tag) = &live.managed {
        record.unique_id = tag.record_key.clone();
        record = record.spawned(tag.prefab_path.clone());
    }
    Some(record)
}

// ---------------------------------------------------------------------------
// Baker
// ---------------------------------------------------------------------------

/// Budgeted bake state machine.
#[derive(Debug)]
pub struct Baker {
    phase: BakePhase,
    rules: EligibilityRules,
    step_budget: usize,
    scene_name: String,
    /// Depth-first work stack; the top is the next node to visit.
    queue: Vec<NodeId>,
    total_nodes: usize,
    processed: usize,
    baked: usize,
    ignored: usize,
    ignore_reasons: BTreeMap<IgnoreReason, usize>,
    histogram: BTreeMap<String, usize>,
    records: BTreeMap<String, BakedRecord>,
    progress: f32,
    status_text: String,
    last_report: Option<BakeReport>,
}

impl Baker {
    /// `step_budget` is clamped to at least one node per step.
    pub fn new(step_budget: usize, rules: EligibilityRules) -> Self {
        Self {
            phase: BakePhase::Idle,
            rules,
            step_budget: step_budget.max(1),
            scene_name: String::new(),
            queue: Vec::new(),
            total_nodes: 0,
            processed: 0,
            baked: 0,
            ignored: 0,
            ignore_reasons: BTreeMap::new(),
            histogram: BTreeMap::new(),
            records: BTreeMap::new(),
            progress: 0.0,
            status_text: "Idle".to_owned(),
            last_report: None,
        }
    }

    pub fn phase(&self) -> BakePhase {
        self.phase
    }

    pub fn is_baking(&self) -> bool {
        self.phase != BakePhase::Idle
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn last_report(&self) -> Option<&BakeReport> {
        self.last_report.as_ref()
    }

    pub fn status(&self) -> BakeStatus {
        BakeStatus {
            phase: self.phase,
            progress: self.progress,
            status_text: self.status_text.clone(),
            total_nodes: self.total_nodes,
            processed: self.processed,
            baked: self.baked,
            ignored: self.ignored,
            histogram: self.histogram.clone(),
        }
    }

    /// Begin baking `scene`.
    ///
    /// # Errors
    ///
    /// - [`BakeError::AlreadyBaking`] if a bake is running; the running bake
    ///   is not disturbed.
    /// - [`BakeError::StoreUnavailable`] if `store` is `None`; the baker stays
    ///   idle.
    pub fn start_baking(
        &mut self,
        scene: &dyn SceneGraph,
        store: Option<&SceneDatabase>,
    ) -> Result<(), BakeError> {
        if self.is_baking() {
            tracing::warn!(
                scene = %self.scene_name,
                phase = ?self.phase,
                "bake requested while one is running; ignored"
            );
            return Err(BakeError::AlreadyBaking { phase: self.phase });
        }
        if store.is_none() {
            tracing::error!(scene = scene.scene_name(), "bake aborted: no store available");
            self.status_text = "Bake failed: no store available".to_owned();
            return Err(BakeError::StoreUnavailable);
        }

        self.reset(scene.scene_name());
        self.queue = scene.roots().iter().rev().copied().collect();
        self.phase = BakePhase::Analyzing;
        self.status_text = format!("Analyzing '{}'", self.scene_name);
        tracing::info!(scene = %self.scene_name, "bake started");
        Ok(())
    }

    /// Run one budgeted step of the current phase.
    ///
    /// # Errors
    ///
    /// Returns [`BakeError::StoreUnavailable`] or [`BakeError::StoreRejected`]
    /// when saving cannot proceed. Either way the bake is aborted and the
    /// baker returns to idle.
    pub fn step(
        &mut self,
        scene: &dyn SceneGraph,
        ids: &dyn IdentityGenerator,
        store: Option<&mut SceneDatabase>,
        diagnostics: &mut dyn DiagnosticsSink,
    ) -> Result<BakeStep, BakeError> {
        match self.phase {
            BakePhase::Idle => Ok(BakeStep::Idle),
            BakePhase::Analyzing => {
                self.analyze(scene);
                Ok(BakeStep::InProgress(self.progress))
            }
            BakePhase::Walking => {
                self.walk(scene, ids, diagnostics);
                Ok(BakeStep::InProgress(self.progress))
            }
            BakePhase::Saving => self.save(store, diagnostics).map(BakeStep::Finished),
        }
    }

    // -- phases -------------------------------------------------------------

    fn analyze(&mut self, scene: &dyn SceneGraph) {
        for _ in 0..self.step_budget {
            let Some(id) = self.queue.pop() else { break };
            let Some(node) = scene.node(id) else { continue };
            self.total_nodes += 1;
            for component in &node.components {
                *self.histogram.entry(component.type_name.clone()).or_default() += 1;
            }
            self.queue.extend(node.children.iter().rev().copied());
        }

        if self.queue.is_empty() {
            tracing::info!(
                scene = %self.scene_name,
                total_nodes = self.total_nodes,
                component_types = self.histogram.len(),
                "analysis complete"
            );
            self.queue = scene.roots().iter().rev().copied().collect();
            self.phase = BakePhase::Walking;
            self.advance_progress(ANALYZE_SHARE);
            self.status_text = format!("Baking '{}': 0/{}", self.scene_name, self.total_nodes);
        }
    }

    fn walk(
        &mut self,
        scene: &dyn SceneGraph,
        ids: &dyn IdentityGenerator,
        diagnostics: &mut dyn DiagnosticsSink,
    ) {
        for _ in 0..self.step_budget {
            let Some(id) = self.queue.pop() else { break };
            self.processed += 1;

            let Some(node) = scene.node(id) else {
                tracing::warn!(node = %id, "node vanished before it was baked");
                self.ignore(IgnoreReason::Missing);
                continue;
            };
            self.queue.extend(node.children.iter().rev().copied());

            let verdict = if node.managed.is_some() {
                Eligibility::Eligible
            } else {
                self.rules.evaluate(scene, id)
            };
            match verdict {
                Eligibility::Eligible => match snapshot_record(scene, ids, id) {
                    Some(record) => self.bake(record),
                    None => self.ignore(IgnoreReason::Missing),
                },
                Eligibility::Ignored(reason) => {
                    tracing::trace!(node = %id, name = %node.name, ?reason, "ignored");
                    self.ignore(reason);
                }
            }
        }

        let fraction = if self.total_nodes == 0 {
            1.0
        } else {
            (self.processed as f32 / self.total_nodes as f32).min(1.0)
        };
        self.advance_progress(ANALYZE_SHARE + WALK_SHARE * fraction);
        self.status_text = format!(
            "Baking '{}': {}/{}",
            self.scene_name, self.processed, self.total_nodes
        );
        diagnostics.track_progress(Phase::Baking, self.baked, self.ignored);

        if self.queue.is_empty() {
            tracing::info!(
                scene = %self.scene_name,
                baked = self.baked,
                ignored = self.ignored,
                "walk complete"
            );
            self.phase = BakePhase::Saving;
            self.advance_progress(ANALYZE_SHARE + WALK_SHARE);
            self.status_text = format!("Saving '{}'", self.scene_name);
        }
    }

    fn save(
        &mut self,
        store: Option<&mut SceneDatabase>,
        diagnostics: &mut dyn DiagnosticsSink,
    ) -> Result<BakeReport, BakeError> {
        let Some(store) = store else {
            tracing::error!(scene = %self.scene_name, "store disappeared before saving; bake aborted");
            diagnostics.add_error(Phase::Saving, "no store available".to_owned());
            self.abort("Bake failed: no store available");
            return Err(BakeError::StoreUnavailable);
        };

        let records = std::mem::take(&mut self.records);
        let count = records.len();
        let merge = match store.merge_partition(&self.scene_name, records.into_values()) {
            Ok(summary) => summary,
            Err(err) => {
                tracing::error!(scene = %self.scene_name, error = %err, "store rejected baked records");
                diagnostics.add_error(Phase::Saving, err.to_string());
                let scene = self.scene_name.clone();
                self.abort("Bake failed: store rejected records");
                return Err(BakeError::StoreRejected {
                    scene,
                    details: err.to_string(),
                });
            }
        };

        let persisted = match store.persist() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(scene = %self.scene_name, error = %err, "baked records merged but not persisted");
                diagnostics.add_error(Phase::Saving, format!("persist failed: {err}"));
                false
            }
        };
        diagnostics.track_progress(Phase::Saving, count, if persisted { 0 } else { count });

        let report = BakeReport {
            scene_name: self.scene_name.clone(),
            total_nodes: self.total_nodes,
            baked: self.baked,
            ignored: self.ignored,
            ignore_reasons: self.ignore_reasons.clone(),
            histogram: self.histogram.clone(),
            merge,
            persisted,
        };
        tracing::info!(
            scene = %report.scene_name,
            baked = report.baked,
            ignored = report.ignored,
            inserted = merge.inserted,
            overwritten = merge.overwritten,
            persisted,
            "bake finished"
        );

        self.phase = BakePhase::Idle;
        self.advance_progress(1.0);
        self.status_text = format!("Baked {} objects ({} ignored)", self.baked, self.ignored);
        self.last_report = Some(report.clone());
        Ok(report)
    }

    // -- helpers ------------------------------------------------------------

    /// Keep the first record per key; a later node with the same key is
    /// counted as ignored.
    fn bake(&mut self, record: BakedRecord) {
        match self.records.entry(record.unique_id.clone()) {
            Entry::Occupied(first) => {
                tracing::warn!(
                    key = %record.unique_id,
                    kept = %first.get().item_path,
                    dropped = %record.item_path,
                    "two nodes share one record key"
                );
                self.ignore(IgnoreReason::DuplicateKey);
            }
            Entry::Vacant(slot) => {
                tracing::debug!(key = %record.unique_id, path = %record.item_path, "baked");
                slot.insert(record);
                self.baked += 1;
            }
        }
    }

    fn ignore(&mut self, reason: IgnoreReason) {
        self.ignored += 1;
        *self.ignore_reasons.entry(reason).or_default() += 1;
    }

    fn advance_progress(&mut self, to: f32) {
        self.progress = self.progress.max(to.clamp(0.0, 1.0));
    }

    fn abort(&mut self, status: &str) {
        self.phase = BakePhase::Idle;
        self.queue.clear();
        self.records.clear();
        self.status_text = status.to_owned();
    }

    fn reset(&mut self, scene_name: &str) {
        self.scene_name = scene_name.to_owned();
        self.queue.clear();
        self.total_nodes = 0;
        self.processed = 0;
        self.baked = 0;
        self.ignored = 0;
        self.ignore_reasons.clear();
        self.histogram.clear();
        self.records.clear();
        self.progress = 0.0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use waymark_scene::prelude::*;

    fn workshop() -> SceneTree {
        let mut scene = SceneTree::new("Workshop");
        scene
            .spawn(
                &NodeTemplate::new("Bench")
                    .with(Component::renderer("mesh/bench"))
                    .child(NodeTemplate::new("Vice").with(Component::collider()))
                    .child(NodeTemplate::new("TEMP_Marker").with(Component::renderer("mesh/cone"))),
                None,
            )
            .unwrap();
        scene
            .spawn(&NodeTemplate::new("Lamp").with(Component::light()), None)
            .unwrap();
        scene
    }

    fn run(baker: &mut Baker, scene: &SceneTree, store: &mut SceneDatabase) -> (BakeReport, Vec<f32>) {
        let mut diagnostics = Diagnostics::new();
        let mut progress = vec![baker.progress()];
        loop {
            match baker
                .step(scene, &HierarchyIdentity::new(), Some(&mut *store), &mut diagnostics)
                .unwrap()
            {
                BakeStep::Finished(report) => {
                    progress.push(baker.progress());
                    return (report, progress);
                }
                BakeStep::InProgress(p) => progress.push(p),
                BakeStep::Idle => panic!("baker went idle without finishing"),
            }
        }
    }

    #[test]
    fn bakes_eligible_and_counts_the_rest() {
        let scene = workshop();
        let mut store = SceneDatabase::in_memory();
        let mut baker = Baker::new(2, EligibilityRules::default());
        baker.start_baking(&scene, Some(&store)).unwrap();
        let (report, _) = run(&mut baker, &scene, &mut store);

        assert_eq!(report.total_nodes, 4);
        assert_eq!(report.baked, 2);
        assert_eq!(report.ignored, 2);
        assert_eq!(report.ignore_reasons[&IgnoreReason::Temporary], 1);
        assert_eq!(report.ignore_reasons[&IgnoreReason::CameraOrLight], 1);
        assert_eq!(report.histogram["MeshRenderer"], 2);
        assert!(report.persisted);
        assert!(!baker.is_baking());

        let bench = store.lookup_by_path("Workshop", "Bench").unwrap();
        assert_eq!(bench.children, vec!["Bench/Vice", "Bench/TEMP_Marker"]);
        assert_eq!(
            store.lookup_by_path("Workshop", "Bench/Vice").unwrap().parent_path,
            "Bench"
        );
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_one() {
        let scene = workshop();
        let mut store = SceneDatabase::in_memory();
        let mut baker = Baker::new(1, EligibilityRules::default());
        baker.start_baking(&scene, Some(&store)).unwrap();
        let (_, progress) = run(&mut baker, &scene, &mut store);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.last().copied(), Some(1.0));
    }

    #[test]
    fn second_start_is_rejected_without_side_effects() {
        let scene = workshop();
        let store = SceneDatabase::in_memory();
        let mut baker = Baker::new(1, EligibilityRules::default());
        baker.start_baking(&scene, Some(&store)).unwrap();
        let before = baker.status();
        let err = baker.start_baking(&scene, Some(&store)).unwrap_err();
        assert_eq!(err, BakeError::AlreadyBaking { phase: BakePhase::Analyzing });
        assert_eq!(baker.status(), before);
    }

    #[test]
    fn missing_store_is_fatal() {
        let scene = workshop();
        let mut baker = Baker::new(10, EligibilityRules::default());
        assert_eq!(
            baker.start_baking(&scene, None),
            Err(BakeError::StoreUnavailable)
        );
        assert!(!baker.is_baking());

        // Store vanishing between start and save aborts as well.
        let store = SceneDatabase::in_memory();
        let mut diagnostics = Diagnostics::new();
        baker.start_baking(&scene, Some(&store)).unwrap();
        let ids = HierarchyIdentity::new();
        let err = loop {
            match baker.step(&scene, &ids, None, &mut diagnostics) {
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(err, BakeError::StoreUnavailable);
        assert!(!baker.is_baking());
        assert_eq!(diagnostics.errors_for(Phase::Saving).len(), 1);
    }

    #[test]
    fn managed_nodes_keep_their_key() {
        let mut scene = workshop();
        scene.register_prefab("prefabs/crate", NodeTemplate::new("Crate"));
        let spawned = scene
            .instantiate("prefabs/crate", None, Transform::IDENTITY)
            .unwrap();
        scene
            .set_managed(
                spawned,
                ManagedTag {
                    record_key: "spawn-1".to_owned(),
                    prefab_path: "prefabs/crate".to_owned(),
                },
            )
            .unwrap();

        let mut store = SceneDatabase::in_memory();
        let mut baker = Baker::new(50, EligibilityRules::default());
        baker.start_baking(&scene, Some(&store)).unwrap();
        let (report, _) = run(&mut baker, &scene, &mut store);

        // A bare crate would be ignored; managed nodes are always recorded.
        assert_eq!(report.baked, 3);
        let record = store.get_record("Workshop", "spawn-1").unwrap();
        assert!(record.is_spawned);
        assert_eq!(record.prefab_path, "prefabs/crate");
    }

    #[test]
    fn shared_record_key_is_baked_once() {
        let mut scene = workshop();
        scene.register_prefab("prefabs/crate", NodeTemplate::new("Crate"));
        for x in [1.0, 2.0] {
            let id = scene
                .instantiate("prefabs/crate", None, Transform::from_position(Vec3::new(x, 0.0, 0.0)))
                .unwrap();
            scene
                .set_managed(
                    id,
                    ManagedTag {
                        record_key: "spawn-1".to_owned(),
                        prefab_path: "prefabs/crate".to_owned(),
                    },
                )
                .unwrap();
        }

        let mut store = SceneDatabase::in_memory();
        let mut baker = Baker::new(50, EligibilityRules::default());
        baker.start_baking(&scene, Some(&store)).unwrap();
        let (report, _) = run(&mut baker, &scene, &mut store);

        assert_eq!(report.baked, 3);
        assert_eq!(report.ignore_reasons[&IgnoreReason::DuplicateKey], 1);
        assert_eq!(report.baked + report.ignored, report.total_nodes);
        assert_eq!(store.partition("Workshop").unwrap().len(), report.baked);
        // The first crate in walk order owns the key.
        assert_eq!(store.get_record("Workshop", "spawn-1").unwrap().position.x, 1.0);
    }

    #[test]
    fn stale_node_in_queue_counts_as_ignored() {
        let mut scene = workshop();
        let mut store = SceneDatabase::in_memory();
        let mut diagnostics = Diagnostics::new();
        let ids = HierarchyIdentity::new();
        let mut baker = Baker::new(1, EligibilityRules::default());
        baker.start_baking(&scene, Some(&store)).unwrap();

        // Finish analysis, then walk only the first root.
        while baker.phase() == BakePhase::Analyzing {
            baker.step(&scene, &ids, Some(&mut store), &mut diagnostics).unwrap();
        }
        baker.step(&scene, &ids, Some(&mut store), &mut diagnostics).unwrap();

        let lamp = scene.find_by_path("Lamp").unwrap();
        scene.destroy(lamp).unwrap();
        let (report, _) = run(&mut baker, &scene, &mut store);
        assert_eq!(report.ignore_reasons[&IgnoreReason::Missing], 1);
        assert_eq!(report.baked + report.ignored, 4);
    }
}
