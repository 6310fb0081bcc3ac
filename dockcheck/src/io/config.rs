//! Loading of policy, pipeline and runtime settings files.
//!
//! Policy and pipeline documents are YAML; runtime settings live in
//! `.dockcheck/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::confidence::{ConfidenceScorer, DEFAULT_WEIGHTS};
use crate::core::policy::Policy;
use crate::core::types::PipelineConfig;
use crate::io::dispatch::DEFAULT_OUTPUT_LIMIT_BYTES;
use crate::io::fanout::DEFAULT_MAX_CONCURRENT;
use crate::io::prompt::DEFAULT_PROMPT_BUDGET_BYTES;

pub const DEFAULT_CONFIG_PATH: &str = ".dockcheck/config.toml";

/// Policy locations tried, in order, when none is given explicitly.
pub const POLICY_CANDIDATES: [&str; 2] = [".dockcheck/policy.yaml", "policy.yaml"];

/// Runtime settings (TOML). Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockcheckConfig {
    /// Extra dispatches allowed when an agent asks for a retry.
    pub max_retries: u32,

    /// Upper bound on simultaneous fan-out dispatches.
    pub max_concurrent: usize,

    /// Per-stream cap on captured agent stdout/stderr.
    pub output_limit_bytes: usize,

    /// Step prompts larger than this drop optional sections.
    pub prompt_budget_bytes: usize,

    /// Scorer weights by step name, merged over the built-in table.
    pub weights: BTreeMap<String, f64>,
}

impl Default for DockcheckConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            prompt_budget_bytes: DEFAULT_PROMPT_BUDGET_BYTES,
            weights: BTreeMap::new(),
        }
    }
}

impl DockcheckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if let Some((step, weight)) = self
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(anyhow!("weights.{step} must be a non-negative number, got {weight}"));
        }
        Ok(())
    }

    /// Scorer using the built-in weights overlaid with `weights`.
    pub fn scorer(&self) -> ConfidenceScorer {
        let mut merged: BTreeMap<String, f64> = DEFAULT_WEIGHTS
            .iter()
            .map(|(name, weight)| (name.to_string(), *weight))
            .collect();
        merged.extend(self.weights.iter().map(|(k, v)| (k.clone(), *v)));
        ConfidenceScorer::with_weights(merged)
    }
}

/// Load runtime settings. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<DockcheckConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(DockcheckConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DockcheckConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn load_policy(path: &Path) -> Result<Policy> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Policy::from_yaml_str(&contents).with_context(|| format!("parse policy {}", path.display()))
}

pub fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("parse pipeline {}", path.display()))
}

/// Service list for fan-out: a YAML sequence of string maps such as
/// `- {name: api, path: services/api}`.
pub fn load_services(path: &Path) -> Result<Vec<BTreeMap<String, String>>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("parse services {}", path.display()))
}

/// First existing entry of [`POLICY_CANDIDATES`] under `root`.
pub fn find_policy(root: &Path) -> Option<PathBuf> {
    POLICY_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}
