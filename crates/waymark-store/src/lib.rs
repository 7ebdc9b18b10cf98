//! Waymark Store -- durable, scene-partitioned Baked Records.
//!
//! # Modules
//!
//! - [`record`]: the [`BakedRecord`](record::BakedRecord) type and its
//!   invariants.
//! - [`database`]: [`SceneDatabase`](database::SceneDatabase), the two-level
//!   `scene -> unique id -> record` map with path/identity lookup indices.
//! - [`backend`]: byte-level persistence behind the database, with an atomic
//!   file implementation and an in-memory one.

#![deny(unsafe_code)]

use std::path::PathBuf;

pub mod backend;
pub mod database;
pub mod record;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported store format '{format}' version {version}")]
    UnsupportedFormat { format: String, version: u32 },

    /// The stored checksum does not match the stored content.
    #[error("store checksum mismatch: recorded {recorded} but computed {computed}")]
    ChecksumMismatch { recorded: String, computed: String },

    #[error("invalid record in scene '{scene}': {source}")]
    InvalidRecord {
        scene: String,
        #[source]
        source: record::RecordError,
    },

    /// A record was filed under the wrong scene or key.
    #[error("record '{key}' in scene '{scene}' is misfiled: {details}")]
    Misfiled {
        scene: String,
        key: String,
        details: String,
    },

    #[error("no record '{key}' in scene '{scene}'")]
    UnknownRecord { scene: String, key: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::backend::{FileBackend, MemoryBackend, StoreBackend};
    pub use crate::database::{MatchKind, MergeSummary, Partition, Resolved, SceneDatabase};
    pub use crate::record::{BakedRecord, RecordError};
    pub use crate::StoreError;
}
