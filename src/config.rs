//! Engine configuration.
//!
//! All knobs live in one serde-deserializable structure with explicit
//! defaults. [`EngineConfig::load`] layers an optional config file and
//! `SLUICE_`-prefixed environment variables on top of those defaults, so an
//! embedded engine can also be constructed from `EngineConfig::default()`
//! and adjusted in code.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Folder for spool job descriptors, one JSON file per flow id.
    pub spool_folder: PathBuf,

    /// Folder for request payload backups, one JSON file per channel id.
    pub payload_folder: PathBuf,

    /// Number of single-worker spool lanes; jobs are sharded onto a lane by
    /// target-name hash so one target never runs concurrently with itself.
    pub spool_workers: usize,

    /// Whether a channel fans targets out onto concurrent tasks.
    pub concurrent_channels: bool,

    /// Metadata table holding API definitions.
    pub api_table: String,

    /// Metadata table holding flow definitions.
    pub flow_table: String,

    /// Metadata table holding datasource (connection info) definitions.
    pub datasource_table: String,

    /// Metadata table holding document template definitions.
    pub template_table: String,

    /// Optional cap on module activations per flow; a chain exceeding it
    /// fails with a logic error. `None` preserves the unchecked behavior.
    pub max_steps: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spool_folder: PathBuf::from("spool"),
            payload_folder: PathBuf::from("payload"),
            spool_workers: 4,
            concurrent_channels: false,
            api_table: "API".to_string(),
            flow_table: "FLOW".to_string(),
            datasource_table: "DATASOURCE".to_string(),
            template_table: "TEMPLATE".to_string(),
            max_steps: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus `SLUICE_*` environment
    /// overrides, on top of the built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("SLUICE"))
            .build()
            .map_err(|e| SluiceError::Config(e.to_string()))?;

        let mut cfg = EngineConfig::default();
        let overlay: serde_json::Value = settings
            .try_deserialize()
            .map_err(|e| SluiceError::Config(e.to_string()))?;
        if let Some(obj) = overlay.as_object() {
            let mut base = serde_json::to_value(&cfg)?;
            if let Some(base_obj) = base.as_object_mut() {
                for (k, v) in obj {
                    base_obj.insert(k.clone(), v.clone());
                }
            }
            cfg = serde_json::from_value(base)?;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.spool_workers, 4);
        assert!(!cfg.concurrent_channels);
        assert!(cfg.max_steps.is_none());
        assert_eq!(cfg.flow_table, "FLOW");
    }

    #[test]
    fn load_without_file_yields_defaults() {
        let cfg = EngineConfig::load(None).unwrap();
        assert_eq!(cfg.api_table, "API");
    }
}
