//! Operator-facing diagnostics: per-phase counters, error text, and an
//! optional host notifier.
//!
//! The engine only ever *writes* to a [`DiagnosticsSink`]; nothing it reports
//! feeds back into bake or reconciliation decisions. [`Diagnostics`] is the
//! stock sink, accumulating a [`PhaseReport`] per [`Phase`].
//!
//! # Example
//!
//! ```
//! use waymark_engine::diagnostics::{Diagnostics, DiagnosticsSink, Phase};
//!
//! let mut diagnostics = Diagnostics::new();
//! diagnostics.track_progress(Phase::Reconciliation, 119, 1);
//! diagnostics.add_error(Phase::Reconciliation, "Line/Press: no live node".to_owned());
//!
//! let report = diagnostics.phase(Phase::Reconciliation).unwrap();
//! assert_eq!(report.processed, 119);
//! assert_eq!(report.failed, 1);
//! assert_eq!(report.errors.len(), 1);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// The pass a diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Baking,
    Saving,
    Reconciliation,
    Edit,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Baking => "Baking",
            Phase::Saving => "Saving",
            Phase::Reconciliation => "Reconciliation",
            Phase::Edit => "Edit",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DiagnosticsSink
// ---------------------------------------------------------------------------

/// Write-only destination for pass counters and errors.
pub trait DiagnosticsSink {
    /// Report the latest totals for `phase`. Replaces earlier totals.
    fn track_progress(&mut self, phase: Phase, processed: usize, failed: usize);

    /// Append an error message to `phase`.
    fn add_error(&mut self, phase: Phase, message: String);
}

/// Counters and messages for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Accumulating [`DiagnosticsSink`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    phases: BTreeMap<Phase, PhaseReport>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.get(&phase)
    }

    /// Errors recorded for `phase`, oldest first.
    pub fn errors_for(&self, phase: Phase) -> &[String] {
        self.phases
            .get(&phase)
            .map(|r| r.errors.as_slice())
            .unwrap_or(&[])
    }

    pub fn total_errors(&self) -> usize {
        self.phases.values().map(|r| r.errors.len()).sum()
    }

    pub fn clear(&mut self) {
        self.phases.clear();
    }

    /// One line per phase, e.g. `Reconciliation: 119 ok, 1 failed, 1 error(s)`.
    pub fn summary(&self) -> String {
        self.phases
            .iter()
            .map(|(phase, r)| {
                format!(
                    "{phase}: {} ok, {} failed, {} error(s)",
                    r.processed,
                    r.failed,
                    r.errors.len()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DiagnosticsSink for Diagnostics {
    fn track_progress(&mut self, phase: Phase, processed: usize, failed: usize) {
        let report = self.phases.entry(phase).or_default();
        report.processed = processed;
        report.failed = failed;
    }

    fn add_error(&mut self, phase: Phase, message: String) {
        tracing::debug!(%phase, %message, "diagnostic error recorded");
        self.phases.entry(phase).or_default().errors.push(message);
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Optional host capability for surfacing short messages to the operator.
///
/// The engine calls it only when one is installed and never depends on it.
pub trait Notifier {
    fn notify(&self, title: &str, text: &str, is_error: bool);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
