//! The per-process Waymark context.
//!
//! A [`Session`] owns the configuration, the store, the baker, the reconciler,
//! diagnostics, the identity generator and an optional notifier. It is built
//! once and handed to whatever drives the host's frame loop: the host calls
//! [`Session::tick`] every frame and forwards scene loads and operator actions.
//!
//! Bake and reconciliation never overlap. A bake requested while a scene is
//! being reconciled is rejected with [`BakeError::ReconcileInProgress`].

use std::time::Duration;

use waymark_scene::identity::{HierarchyIdentity, IdentityGenerator};
use waymark_scene::node::NodeId;
use waymark_scene::transform::Transform;
use waymark_scene::tree::SceneGraph;
use waymark_store::backend::FileBackend;
use waymark_store::database::SceneDatabase;
use waymark_store::StoreError;

use crate::bake::{BakeReport, BakeStatus, BakeStep, Baker};
use crate::config::WaymarkConfig;
use crate::diagnostics::{Diagnostics, Notifier};
use crate::edit::EditRecorder;
use crate::reconcile::{ReconcileReport, ReconcileStep, Reconciler};
use crate::{BakeError, EditError};

const NOTIFY_TITLE: &str = "Waymark";

/// Something that finished during a [`Session::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    BakeFinished(BakeReport),
    BakeFailed(BakeError),
    ReconcileFinished(ReconcileReport),
}

/// Owner of every Waymark component for one host process.
pub struct Session {
    config: WaymarkConfig,
    store: Option<SceneDatabase>,
    identity: Box<dyn IdentityGenerator>,
    baker: Baker,
    reconciler: Reconciler,
    diagnostics: Diagnostics,
    notifier: Option<Box<dyn Notifier>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("baker", &self.baker)
            .field("reconciler", &self.reconciler)
            .field("has_notifier", &self.notifier.is_some())
            .finish()
    }
}

impl Session {
    /// Validate `config` and open the file store it names, if persistence is
    /// enabled.
    pub fn open(config: WaymarkConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = if config.persistence_enabled {
            let db = SceneDatabase::open(Box::new(FileBackend::new(&config.store_path)))?;
            tracing::info!(
                path = %config.store_path.display(),
                scenes = db.scene_names().count(),
                "store opened"
            );
            Some(db)
        } else {
            tracing::info!("persistence disabled; running without a store");
            None
        };
        Ok(Self::with_store(config, store))
    }

    /// Build a session around an already opened store (or none).
    pub fn with_store(config: WaymarkConfig, store: Option<SceneDatabase>) -> Self {
        let baker = Baker::new(config.bake_step_budget, config.eligibility.clone());
        let reconciler = Reconciler::new(
            config.eligibility.clone(),
            config.reconcile_step_budget,
            config.settle_delay(),
            config.retry_interval(),
            config.max_retries,
        );
        Self {
            config,
            store,
            identity: Box::new(HierarchyIdentity::new()),
            baker,
            reconciler,
            diagnostics: Diagnostics::new(),
            notifier: None,
        }
    }

    pub fn with_identity(mut self, identity: Box<dyn IdentityGenerator>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &WaymarkConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&SceneDatabase> {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> Option<&mut SceneDatabase> {
        self.store.as_mut()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn is_baking(&self) -> bool {
        self.baker.is_baking()
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciler.is_active()
    }

    pub fn bake_status(&self) -> BakeStatus {
        self.baker.status()
    }

    // -- bake ---------------------------------------------------------------

    /// Start baking `scene`. Work happens in subsequent [`tick`](Self::tick)s.
    pub fn start_baking(&mut self, scene: &dyn SceneGraph) -> Result<(), BakeError> {
        if self.reconciler.is_active() {
            tracing::warn!(
                scene = self.reconciler.scene_name(),
                "bake requested during reconciliation; rejected"
            );
            return Err(BakeError::ReconcileInProgress {
                scene: self.reconciler.scene_name().to_owned(),
            });
        }
        let result = self.baker.start_baking(scene, self.store.as_ref());
        if let Err(BakeError::StoreUnavailable) = &result {
            self.notify("Bake failed: no store is available", true);
        }
        result
    }

    /// Start a bake and step it until it finishes.
    pub fn bake_to_completion(&mut self, scene: &dyn SceneGraph) -> Result<BakeReport, BakeError> {
        self.start_baking(scene)?;
        loop {
            match self.bake_step(scene) {
                Ok(BakeStep::Finished(report)) => return Ok(report),
                Ok(BakeStep::Idle) => return Err(BakeError::StoreUnavailable),
                Ok(BakeStep::InProgress(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn bake_step(&mut self, scene: &dyn SceneGraph) -> Result<BakeStep, BakeError> {
        let step = self.baker.step(
            scene,
            self.identity.as_ref(),
            self.store.as_mut(),
            &mut self.diagnostics,
        );
        match &step {
            Ok(BakeStep::Finished(report)) => {
                let text = format!(
                    "Baked {} objects in '{}' ({} ignored)",
                    report.baked, report.scene_name, report.ignored
                );
                self.notify(&text, !report.persisted);
            }
            Err(err) => self.notify(&format!("Bake failed: {err}"), true),
            Ok(_) => {}
        }
        step
    }

    // -- reconcile ----------------------------------------------------------

    /// Schedule reconciliation of a freshly loaded scene. Returns `false` if
    /// nothing was scheduled.
    pub fn on_scene_loaded(&mut self, scene_name: &str) -> bool {
        if self.store.is_none() {
            tracing::info!(scene = scene_name, "no store; reconciliation skipped");
            return false;
        }
        if self.baker.is_baking() {
            tracing::warn!(scene = scene_name, "scene loaded during a bake; reconciliation skipped");
            return false;
        }
        self.reconciler.begin(scene_name);
        true
    }

    /// Advance reconciliation with `dt` per call until it finishes.
    pub fn reconcile_to_completion(
        &mut self,
        scene: &mut dyn SceneGraph,
        dt: Duration,
    ) -> Option<ReconcileReport> {
        while self.reconciler.is_active() {
            if self.store.is_none() {
                tracing::warn!(
                    scene = self.reconciler.scene_name(),
                    "no store; abandoning reconciliation"
                );
                return None;
            }
            if let Some(report) = self.reconcile_step(dt, scene) {
                return Some(report);
            }
        }
        None
    }

    fn reconcile_step(&mut self, dt: Duration, scene: &mut dyn SceneGraph) -> Option<ReconcileReport> {
        let store = self.store.as_ref()?;
        match self
            .reconciler
            .advance(dt, scene, self.identity.as_ref(), store, &mut self.diagnostics)
        {
            ReconcileStep::Finished(report) => {
                let text = format!(
                    "Reconciled '{}': {} applied, {} missed",
                    report.scene_name,
                    report.applied,
                    report.missed.len()
                );
                self.notify(&text, !report.missed.is_empty());
                Some(report)
            }
            ReconcileStep::Idle | ReconcileStep::InProgress(_) => None,
        }
    }

    // -- frame loop ---------------------------------------------------------

    /// Do one frame's worth of work on whichever pass is running.
    pub fn tick(&mut self, dt: Duration, scene: &mut dyn SceneGraph) -> Option<SessionEvent> {
        if self.baker.is_baking() {
            return match self.bake_step(&*scene) {
                Ok(BakeStep::Finished(report)) => Some(SessionEvent::BakeFinished(report)),
                Ok(_) => None,
                Err(err) => Some(SessionEvent::BakeFailed(err)),
            };
        }
        if self.reconciler.is_active() {
            return self
                .reconcile_step(dt, scene)
                .map(SessionEvent::ReconcileFinished);
        }
        None
    }

    // -- edits --------------------------------------------------------------

    pub fn record_transform(
        &mut self,
        scene: &dyn SceneGraph,
        node: NodeId,
    ) -> Result<String, EditError> {
        let store = self.store.as_mut().ok_or(EditError::StoreUnavailable)?;
        EditRecorder::new(store, self.identity.as_ref()).record_transform(scene, node)
    }

    pub fn record_destroy(
        &mut self,
        scene: &mut dyn SceneGraph,
        node: NodeId,
    ) -> Result<Option<String>, EditError> {
        let store = self.store.as_mut().ok_or(EditError::StoreUnavailable)?;
        EditRecorder::new(store, self.identity.as_ref()).record_destroy(scene, node)
    }

    pub fn spawn(
        &mut self,
        scene: &mut dyn SceneGraph,
        prefab: &str,
        parent: Option<NodeId>,
        transform: Transform,
    ) -> Result<(NodeId, String), EditError> {
        let store = self.store.as_mut().ok_or(EditError::StoreUnavailable)?;
        EditRecorder::new(store, self.identity.as_ref()).spawn(scene, prefab, parent, transform)
    }

    /// Persist the store if it has unsaved changes. Returns `true` if
    /// anything was written.
    pub fn save(&mut self) -> Result<bool, StoreError> {
        match self.store.as_mut() {
            Some(store) if store.is_dirty() => {
                store.persist()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn notify(&self, text: &str, is_error: bool) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(NOTIFY_TITLE, text, is_error);
        }
    }
}
