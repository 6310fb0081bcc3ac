//! Shared deterministic types for pipeline steps and their results.
//!
//! These types define stable contracts between the orchestrator, the scorer and
//! the dispatch layer. They carry no I/O and serialize to the same shape agents
//! are asked to produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::agent::AgentKind;

/// Severity of a single agent finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Structured observation reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl Finding {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file_path: None,
            line: None,
        }
    }
}

/// Follow-up the agent asks the orchestrator for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionNeeded {
    #[default]
    None,
    Retry,
    Escalate,
}

impl ActionNeeded {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionNeeded::None => "none",
            ActionNeeded::Retry => "retry",
            ActionNeeded::Escalate => "escalate",
        }
    }
}

/// Result of one dispatch attempt for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub completed: bool,
    /// In `[0, 1]`; payloads outside the range are rejected by the output parser.
    pub confidence: f64,
    #[serde(default)]
    pub turns_used: u32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// `null` is accepted and means [`ActionNeeded::None`].
    #[serde(default, deserialize_with = "action_or_none")]
    pub action_needed: ActionNeeded,
}

impl AgentResult {
    /// Failed result that forces the pipeline to stop at this step.
    pub fn escalation(summary: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            completed: false,
            confidence: 0.0,
            turns_used: 0,
            summary: summary.into(),
            findings,
            action_needed: ActionNeeded::Escalate,
        }
    }

    pub fn has_severity(&self, severity: Severity) -> bool {
        self.findings.iter().any(|f| f.severity == severity)
    }
}

fn action_or_none<'de, D>(deserializer: D) -> Result<ActionNeeded, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ActionNeeded>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_max_turns() -> u32 {
    10
}

fn default_timeout_secs() -> u64 {
    300
}

/// One configured pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique within a pipeline.
    pub name: String,
    /// Skill directory name the agent is asked to apply.
    pub skill: String,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Steps of one layer sharing a tag run concurrently.
    #[serde(default)]
    pub parallel_group: Option<String>,
}

/// Ordered list of steps. Order is significant for logging and tie-breaking only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub steps: Vec<StepConfig>,
}

/// Inputs shared by every step of a run and checked against the policy before
/// each dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunContext {
    pub commands: Vec<String>,
    pub file_paths: Vec<String>,
    pub diff: Option<String>,
}

/// Terminal decision of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Deploy,
    Notify,
    Block,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Deploy => "deploy",
            Decision::Notify => "notify",
            Decision::Block => "block",
        }
    }
}

/// Aggregated outcome of one `run_pipeline` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub confidence: f64,
    pub decision: Decision,
    pub step_results: BTreeMap<String, AgentResult>,
    pub blocked: bool,
    pub block_reasons: Vec<String>,
}
