//! Runtime configuration.
//!
//! Configuration is read from a JSON file owned by the host. Every field has a
//! default, so an empty object (or a missing file) is a valid configuration.
//!
//! ```
//! use waymark_engine::config::WaymarkConfig;
//!
//! let config = WaymarkConfig::from_json_str(r#"{ "max_retries": 2 }"#).unwrap();
//! assert_eq!(config.max_retries, 2);
//! assert_eq!(config.bake_step_budget, 50);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waymark_scene::eligibility::EligibilityRules;

/// Errors from loading or validating a [`WaymarkConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config field '{field}': {details}")]
    Invalid { field: &'static str, details: String },
}

/// All knobs consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaymarkConfig {
    /// When false the session runs without a store: bakes fail with
    /// `StoreUnavailable` and reconciliation is skipped.
    pub persistence_enabled: bool,
    /// Location of the durable store file.
    pub store_path: PathBuf,
    /// Grace period after a scene load before reconciliation starts.
    pub settle_delay_ms: u64,
    /// How many times an unresolved record is retried before it is reported.
    pub max_retries: u32,
    /// Spacing between reconciliation retries.
    pub retry_interval_ms: u64,
    /// Nodes processed per bake step.
    pub bake_step_budget: usize,
    /// Nodes processed per reconciliation step.
    pub reconcile_step_budget: usize,
    pub eligibility: EligibilityRules,
}

impl Default for WaymarkConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            store_path: PathBuf::from("waymark_store.json"),
            settle_delay_ms: 2_000,
            max_retries: 5,
            retry_interval_ms: 500,
            bake_step_budget: 50,
            reconcile_step_budget: 50,
            eligibility: EligibilityRules::default(),
        }
    }
}

impl WaymarkConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json_str(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bake_step_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "bake_step_budget",
                details: "must be at least 1".to_owned(),
            });
        }
        if self.reconcile_step_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "reconcile_step_budget",
                details: "must be at least 1".to_owned(),
            });
        }
        if self.persistence_enabled && self.store_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "store_path",
                details: "must be set when persistence is enabled".to_owned(),
            });
        }
        Ok(())
    }
}
