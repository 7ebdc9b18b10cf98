//! The apply layer: bring a freshly loaded scene back in line with its
//! Baked Records.
//!
//! A [`Reconciler`] is started with [`Reconciler::begin`] when a scene loads
//! and is then driven by [`Reconciler::advance`] once per frame:
//!
//! 1. **Settling**: wait out the settle delay so host-side loading scripts can
//!    finish creating their objects.
//! 2. **Matching**: a budgeted depth-first walk over the live nodes. Every
//!    eligible node is resolved against the store (path first, then
//!    identity); Store-managed nodes resolve by their managed key. A matched
//!    record is claimed for the rest of the pass and applied: destroyed
//!    records destroy the node, everything else restores the recorded local
//!    transform unless it already matches.
//! 3. **Resolving**: unclaimed spawned records are instantiated from their
//!    prefab, and the new subtrees go back through Matching so the prefab's
//!    children pick up their own records. Once nothing more can be spawned,
//!    unclaimed destroyed records are already satisfied and native ones stay
//!    pending.
//! 4. **Waiting**: pending records are retried after `retry_interval`, up to
//!    `max_retries` times, then each one is reported as a miss.
//!
//! Every scene mutation is recorded as a [`Mutation`] in the
//! [`ReconcileReport`], so a second pass over an already reconciled scene can
//! be checked to emit nothing.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waymark_scene::eligibility::EligibilityRules;
use waymark_scene::identity::IdentityGenerator;
use waymark_scene::node::NodeId;
use waymark_scene::transform::Transform;
use waymark_scene::tree::{ManagedTag, SceneGraph};
use waymark_store::database::{MatchKind, SceneDatabase};
use waymark_store::record::BakedRecord;

use crate::diagnostics::{DiagnosticsSink, Phase};

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// One change the reconciler made to the live scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    SetTransform {
        key: String,
        item_path: String,
        from: Transform,
        to: Transform,
    },
    Destroy {
        key: String,
        item_path: String,
    },
    Spawn {
        key: String,
        prefab_path: String,
        parent_path: String,
    },
}

impl Mutation {
    /// Key of the record that caused this mutation.
    pub fn key(&self) -> &str {
        match self {
            Mutation::SetTransform { key, .. }
            | Mutation::Destroy { key, .. }
            | Mutation::Spawn { key, .. } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A record that could not be resolved before retries ran out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileMiss {
    pub key: String,
    pub item_path: String,
    pub reason: String,
}

/// Summary of a completed reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scene_name: String,
    /// Records whose intent holds after the pass: matched, destroyed, spawned,
    /// or destroyed records whose node was already gone.
    pub applied: usize,
    /// Matched nodes whose transform was restored.
    pub moved: usize,
    /// Matched nodes that already had the recorded transform.
    pub unchanged: usize,
    pub destroyed: usize,
    pub spawned: usize,
    /// Destroyed records with no live node left to destroy.
    pub already_absent: usize,
    /// Matching rounds run, including the first.
    pub rounds: u32,
    pub mutations: Vec<Mutation>,
    pub missed: Vec<ReconcileMiss>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconcilePhase {
    Idle,
    Settling,
    Matching,
    Resolving,
    Waiting,
    Done,
}

/// Outcome of one [`Reconciler::advance`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileStep {
    /// No pass is running.
    Idle,
    InProgress(ReconcilePhase),
    Finished(ReconcileReport),
}

#[derive(Debug, Clone)]
struct Pending {
    item_path: String,
    reason: String,
}

/// Tick-driven reconciliation state machine.
#[derive(Debug)]
pub struct Reconciler {
    phase: ReconcilePhase,
    rules: EligibilityRules,
    step_budget: usize,
    settle_delay: Duration,
    retry_interval: Duration,
    max_retries: u32,
    scene_name: String,
    /// Time left in the current Settling or Waiting phase.
    remaining: Duration,
    queue: Vec<NodeId>,
    /// Record keys already matched to a live node in this pass.
    claimed: HashSet<String>,
    /// Live nodes already matched in an earlier round.
    matched_nodes: HashSet<NodeId>,
    /// Identity matches rejected this round, with the reason.
    rejected: BTreeMap<String, String>,
    pending: BTreeMap<String, Pending>,
    retries: u32,
    report: ReconcileReport,
}

impl Reconciler {
    pub fn new(
        rules: EligibilityRules,
        step_budget: usize,
        settle_delay: Duration,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            phase: ReconcilePhase::Idle,
            rules,
            step_budget: step_budget.max(1),
            settle_delay,
            retry_interval,
            max_retries,
            scene_name: String::new(),
            remaining: Duration::ZERO,
            queue: Vec::new(),
            claimed: HashSet::new(),
            matched_nodes: HashSet::new(),
            rejected: BTreeMap::new(),
            pending: BTreeMap::new(),
            retries: 0,
            report: ReconcileReport::default(),
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    /// `true` from [`begin`](Self::begin) until the pass finishes.
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, ReconcilePhase::Idle | ReconcilePhase::Done)
    }

    pub fn scene_name(&self) -> &str {
        &self.scene_name
    }

    /// Start a pass for `scene_name`. A pass already running is discarded.
    pub fn begin(&mut self, scene_name: &str) {
        if self.is_active() {
            tracing::warn!(
                previous = %self.scene_name,
                scene = scene_name,
                "scene loaded mid-reconciliation; restarting"
            );
        }
        self.scene_name = scene_name.to_owned();
        self.queue.clear();
        self.claimed.clear();
        self.matched_nodes.clear();
        self.rejected.clear();
        self.pending.clear();
        self.retries = 0;
        self.report = ReconcileReport {
            scene_name: scene_name.to_owned(),
            ..Default::default()
        };
        self.remaining = self.settle_delay;
        self.phase = ReconcilePhase::Settling;
        tracing::info!(
            scene = scene_name,
            settle_ms = self.settle_delay.as_millis() as u64,
            "reconciliation scheduled"
        );
    }

    /// Advance the pass by `dt` of host time and do at most one step of work.
    pub fn advance(
        &mut self,
        dt: Duration,
        scene: &mut dyn SceneGraph,
        ids: &dyn IdentityGenerator,
        store: &SceneDatabase,
        diagnostics: &mut dyn DiagnosticsSink,
    ) -> ReconcileStep {
        match self.phase {
            ReconcilePhase::Idle | ReconcilePhase::Done => return ReconcileStep::Idle,
            ReconcilePhase::Settling => {
                self.remaining = self.remaining.saturating_sub(dt);
                if self.remaining.is_zero() {
                    if !store.is_scene_baked(&self.scene_name) {
                        tracing::info!(scene = %self.scene_name, "scene has no baked records; nothing to reconcile");
                        return self.finish(diagnostics);
                    }
                    self.start_round(&*scene);
                }
            }
            ReconcilePhase::Matching => self.match_step(scene, ids, store),
            ReconcilePhase::Resolving => {
                let spawned = self.spawn_unclaimed(scene, store);
                if !spawned.is_empty() {
                    // Match the prefab's own children against their records
                    // before anything is declared pending.
                    self.queue = spawned.into_iter().rev().collect();
                    self.phase = ReconcilePhase::Matching;
                    return ReconcileStep::InProgress(self.phase);
                }
                self.collect_pending(store);
                if self.pending.is_empty() {
                    return self.finish(diagnostics);
                }
                if self.retries >= self.max_retries {
                    self.report_misses(diagnostics);
                    return self.finish(diagnostics);
                }
                self.retries += 1;
                tracing::debug!(
                    scene = %self.scene_name,
                    pending = self.pending.len(),
                    retry = self.retries,
                    "records unresolved; retrying"
                );
                self.remaining = self.retry_interval;
                self.phase = ReconcilePhase::Waiting;
            }
            ReconcilePhase::Waiting => {
                self.remaining = self.remaining.saturating_sub(dt);
                if self.remaining.is_zero() {
                    self.start_round(&*scene);
                }
            }
        }
        ReconcileStep::InProgress(self.phase)
    }

    // -- phases -------------------------------------------------------------

    fn start_round(&mut self, scene: &dyn SceneGraph) {
        self.report.rounds += 1;
        self.rejected.clear();
        self.queue = scene.roots().iter().rev().copied().collect();
        self.phase = ReconcilePhase::Matching;
    }

    fn match_step(
        &mut self,
        scene: &mut dyn SceneGraph,
        ids: &dyn IdentityGenerator,
        store: &SceneDatabase,
    ) {
        for _ in 0..self.step_budget {
            let Some(id) = self.queue.pop() else { break };
            let Some(node) = scene.node(id) else { continue };
            let children = node.children.clone();
            let managed_key = node.managed.as_ref().map(|tag| tag.record_key.clone());

            let mut alive = true;
            if !self.matched_nodes.contains(&id) {
                if let Some((record, matched_by)) = self.find_record(&*scene, ids, store, id, managed_key) {
                    alive = self.apply(scene, id, &record, matched_by);
                }
            }
            if alive {
                self.queue.extend(children.iter().rev().copied());
            }
        }
        if self.queue.is_empty() {
            self.phase = ReconcilePhase::Resolving;
        }
    }

    fn find_record(
        &mut self,
        scene: &dyn SceneGraph,
        ids: &dyn IdentityGenerator,
        store: &SceneDatabase,
        id: NodeId,
        managed_key: Option<String>,
    ) -> Option<(BakedRecord, Option<MatchKind>)> {
        if let Some(key) = managed_key {
            if self.claimed.contains(&key) {
                return None;
            }
            return store
                .get_record(&self.scene_name, &key)
                .map(|record| (record.clone(), None));
        }

        if !self.rules.evaluate(scene, id).is_eligible() {
            return None;
        }
        let identity = ids.identify(scene, id);
        let claimed = &self.claimed;
        let resolved = store.resolve_unclaimed(&self.scene_name, &identity, &|k| claimed.contains(k))?;

        // A fingerprint hit on a record whose own path is still occupied
        // belongs to that other node; it will claim the record by path.
        if matches!(resolved.matched_by, MatchKind::PathId | MatchKind::ItemId)
            && scene
                .find_by_path(&resolved.record.item_path)
                .is_some_and(|owner| owner != id)
        {
            return None;
        }

        let parent_path = &resolved.record.parent_path;
        if resolved.matched_by.is_identity()
            && !parent_path.is_empty()
            && scene.find_by_path(parent_path).is_none()
        {
            tracing::debug!(
                key = %resolved.record.unique_id,
                node = %id,
                parent = %parent_path,
                "identity match rejected: recorded parent is gone"
            );
            self.rejected.insert(
                resolved.record.unique_id.clone(),
                format!("matched by {:?} but parent '{parent_path}' is missing", resolved.matched_by),
            );
            return None;
        }
        Some((resolved.record.clone(), Some(resolved.matched_by)))
    }

    /// Apply `record` to the live node. Returns `false` if the node is gone
    /// afterwards.
    fn apply(
        &mut self,
        scene: &mut dyn SceneGraph,
        id: NodeId,
        record: &BakedRecord,
        matched_by: Option<MatchKind>,
    ) -> bool {
        let key = record.unique_id.clone();
        tracing::trace!(%key, node = %id, ?matched_by, "record matched");

        if record.is_destroyed {
            return match scene.destroy(id) {
                Ok(()) => {
                    self.claim(key.clone(), id);
                    self.report.destroyed += 1;
                    self.report.applied += 1;
                    self.report.mutations.push(Mutation::Destroy {
                        key,
                        item_path: record.item_path.clone(),
                    });
                    false
                }
                Err(err) => {
                    self.rejected.insert(key, err.to_string());
                    true
                }
            };
        }

        let Some(current) = scene.node(id).map(|n| n.transform) else {
            return false;
        };
        let target = record.transform();
        if current.approx_eq(&target) {
            self.claim(key, id);
            self.report.unchanged += 1;
            self.report.applied += 1;
            return true;
        }
        match scene.set_local_transform(id, target) {
            Ok(()) => {
                self.claim(key.clone(), id);
                self.report.moved += 1;
                self.report.applied += 1;
                self.report.mutations.push(Mutation::SetTransform {
                    key,
                    item_path: record.item_path.clone(),
                    from: current,
                    to: target,
                });
            }
            Err(err) => {
                self.rejected.insert(key, err.to_string());
            }
        }
        true
    }

    /// Instantiate every unclaimed spawned record whose parent is present.
    /// Returns the new subtree roots.
    fn spawn_unclaimed(&mut self, scene: &mut dyn SceneGraph, store: &SceneDatabase) -> Vec<NodeId> {
        let Some(partition) = store.partition(&self.scene_name) else {
            return Vec::new();
        };
        let mut spawned = Vec::new();
        for record in partition.iter() {
            if !record.is_spawned || self.claimed.contains(record.key()) {
                continue;
            }
            match self.spawn(scene, record) {
                Ok(id) => spawned.push(id),
                Err(reason) => {
                    self.rejected.insert(record.unique_id.clone(), reason);
                }
            }
        }
        spawned
    }

    /// Settle what is still unclaimed once no more spawns are possible:
    /// destroyed records are already satisfied, the rest become pending.
    fn collect_pending(&mut self, store: &SceneDatabase) {
        self.pending.clear();
        let Some(partition) = store.partition(&self.scene_name) else {
            return;
        };

        for record in partition.iter() {
            if self.claimed.contains(record.key()) {
                continue;
            }
            if record.is_destroyed {
                self.claimed.insert(record.unique_id.clone());
                self.report.already_absent += 1;
                self.report.applied += 1;
                continue;
            }
            let reason = self
                .rejected
                .get(record.key())
                .cloned()
                .unwrap_or_else(|| "no live node matched".to_owned());
            self.pending.insert(
                record.unique_id.clone(),
                Pending {
                    item_path: record.item_path.clone(),
                    reason,
                },
            );
        }
    }

    fn spawn(&mut self, scene: &mut dyn SceneGraph, record: &BakedRecord) -> Result<NodeId, String> {
        let parent = if record.parent_path.is_empty() {
            None
        } else {
            let parent = scene
                .find_by_path(&record.parent_path)
                .ok_or_else(|| format!("parent '{}' is not in the scene", record.parent_path))?;
            Some(parent)
        };
        let id = scene
            .instantiate(&record.prefab_path, parent, record.transform())
            .map_err(|err| err.to_string())?;
        scene
            .set_managed(
                id,
                ManagedTag {
                    record_key: record.unique_id.clone(),
                    prefab_path: record.prefab_path.clone(),
                },
            )
            .map_err(|err| err.to_string())?;

        tracing::debug!(key = %record.unique_id, prefab = %record.prefab_path, node = %id, "spawned");
        self.claim(record.unique_id.clone(), id);
        self.report.spawned += 1;
        self.report.applied += 1;
        self.report.mutations.push(Mutation::Spawn {
            key: record.unique_id.clone(),
            prefab_path: record.prefab_path.clone(),
            parent_path: record.parent_path.clone(),
        });
        Ok(id)
    }

    fn report_misses(&mut self, diagnostics: &mut dyn DiagnosticsSink) {
        for (key, pending) in std::mem::take(&mut self.pending) {
            tracing::warn!(
                scene = %self.scene_name,
                %key,
                path = %pending.item_path,
                reason = %pending.reason,
                "record unresolved after retries"
            );
            diagnostics.add_error(
                Phase::Reconciliation,
                format!("{} ({key}): {}", pending.item_path, pending.reason),
            );
            self.report.missed.push(ReconcileMiss {
                key,
                item_path: pending.item_path,
                reason: pending.reason,
            });
        }
    }

    fn finish(&mut self, diagnostics: &mut dyn DiagnosticsSink) -> ReconcileStep {
        self.phase = ReconcilePhase::Done;
        self.queue.clear();
        diagnostics.track_progress(
            Phase::Reconciliation,
            self.report.applied,
            self.report.missed.len(),
        );
        tracing::info!(
            scene = %self.scene_name,
            applied = self.report.applied,
            moved = self.report.moved,
            destroyed = self.report.destroyed,
            spawned = self.report.spawned,
            missed = self.report.missed.len(),
            rounds = self.report.rounds,
            "reconciliation finished"
        );
        ReconcileStep::Finished(std::mem::take(&mut self.report))
    }

    fn claim(&mut self, key: String, node: NodeId) {
        self.claimed.insert(key);
        self.matched_nodes.insert(node);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
