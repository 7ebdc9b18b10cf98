//! Waymark Engine -- bake, reconcile and edit passes over a live scene.
//!
//! This crate builds on [`waymark_scene`] and [`waymark_store`] to provide the
//! two cooperative passes at the heart of Waymark:
//!
//! - the [`Baker`](bake::Baker) walks a live scene in budgeted steps and merges
//!   a Baked Record for every eligible node into the store;
//! - the [`Reconciler`](reconcile::Reconciler) waits for a freshly loaded scene
//!   to settle, then matches live nodes back to their records and applies the
//!   recorded transforms, destructions and spawns, retrying what it cannot
//!   resolve yet.
//!
//! Operator edits go through [`EditRecorder`](edit::EditRecorder), and a
//! [`Session`](session::Session) owns all of it for a host that just wants to
//! call `tick` once per frame.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use waymark_engine::prelude::*;
//!
//! let mut scene = SceneTree::new("Factory");
//! scene
//!     .spawn(&NodeTemplate::new("Press").with(Component::renderer("mesh/press")), None)
//!     .unwrap();
//!
//! let config = WaymarkConfig { settle_delay_ms: 0, ..Default::default() };
//! let mut session = Session::with_store(config, Some(SceneDatabase::in_memory()));
//!
//! let report = session.bake_to_completion(&scene).unwrap();
//! assert_eq!(report.baked, 1);
//!
//! session.on_scene_loaded("Factory");
//! let report = session
//!     .reconcile_to_completion(&mut scene, Duration::from_millis(16))
//!     .unwrap();
//! assert_eq!(report.applied, 1);
//! assert!(report.mutations.is_empty());
//! ```

#![deny(unsafe_code)]

pub mod bake;
pub mod config;
pub mod diagnostics;
pub mod edit;
pub mod reconcile;
pub mod session;

use waymark_scene::node::NodeId;
use waymark_scene::SceneError;
use waymark_store::StoreError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use waymark_scene;
pub use waymark_store;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a bake could not start or had to abort.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BakeError {
    #[error("a bake is already running (phase {phase:?})")]
    AlreadyBaking { phase: bake::BakePhase },

    /// Fatal for the pass: there is nowhere to write records.
    #[error("no store is available; bake aborted")]
    StoreUnavailable,

    #[error("reconciliation of scene '{scene}' is in progress")]
    ReconcileInProgress { scene: String },

    #[error("store rejected the baked records of scene '{scene}': {details}")]
    StoreRejected { scene: String, details: String },
}

/// Errors from operator edits.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("node {node} is not in the scene")]
    StaleNode { node: NodeId },

    #[error("no store is available")]
    StoreUnavailable,

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bake::{snapshot_record, BakePhase, BakeReport, BakeStatus, BakeStep, Baker};
    pub use crate::config::{ConfigError, WaymarkConfig};
    pub use crate::diagnostics::{Diagnostics, DiagnosticsSink, Notifier, Phase, PhaseReport};
    pub use crate::edit::EditRecorder;
    pub use crate::reconcile::{
        Mutation, ReconcileMiss, ReconcilePhase, ReconcileReport, ReconcileStep, Reconciler,
    };
    pub use crate::session::{Session, SessionEvent};
    pub use crate::{BakeError, EditError};
    pub use waymark_scene::prelude::*;
    pub use waymark_store::prelude::*;
}
