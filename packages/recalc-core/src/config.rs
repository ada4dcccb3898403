//! Engine configuration.
//!
//! Supports TOML config files, environment variable overrides, and defaults.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RecalcError, Result};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalcConfig {
    /// Records per page for table-wide recompute and reset (default: 1000)
    pub page_size: usize,
    /// Re-runs of a cascade after a stale-version rejection (default: 3)
    pub max_conflict_retries: u32,
    /// Buffered bundles per subscriber on the publish channel (default: 1024)
    pub publish_capacity: usize,
    /// Explicit stack bound for dependency traversal (default: 10000)
    pub max_topological_depth: usize,
}

impl Default for RecalcConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_conflict_retries: 3,
            publish_capacity: 1024,
            max_topological_depth: 10_000,
        }
    }
}

impl RecalcConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RecalcError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| RecalcError::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides.
    /// Environment variables are prefixed with `RECALC_`.
    /// Example: `RECALC_PAGE_SIZE=500` overrides `page_size`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("RECALC_PAGE_SIZE") {
            self.page_size = val
                .parse()
                .map_err(|_| RecalcError::Config(format!("Invalid page_size: {}", val)))?;
        }
        if let Ok(val) = env::var("RECALC_MAX_CONFLICT_RETRIES") {
            self.max_conflict_retries = val.parse().map_err(|_| {
                RecalcError::Config(format!("Invalid max_conflict_retries: {}", val))
            })?;
        }
        if let Ok(val) = env::var("RECALC_PUBLISH_CAPACITY") {
            self.publish_capacity = val
                .parse()
                .map_err(|_| RecalcError::Config(format!("Invalid publish_capacity: {}", val)))?;
        }
        if let Ok(val) = env::var("RECALC_MAX_TOPOLOGICAL_DEPTH") {
            self.max_topological_depth = val.parse().map_err(|_| {
                RecalcError::Config(format!("Invalid max_topological_depth: {}", val))
            })?;
        }
        self.validate()
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(RecalcError::Config("page_size must be positive".to_string()));
        }
        if self.publish_capacity == 0 {
            return Err(RecalcError::Config(
                "publish_capacity must be positive".to_string(),
            ));
        }
        if self.max_topological_depth == 0 {
            return Err(RecalcError::Config(
                "max_topological_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
