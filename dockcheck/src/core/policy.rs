//! Policy document and its evaluator.
//!
//! A policy is loaded once per run and never mutated. [`PolicyEngine::evaluate`]
//! is a pure function of the compiled policy and its input: hard stops
//! (dangerous commands, critical paths) force [`Verdict::Block`], circuit
//! breakers degrade to [`Verdict::Fail`].

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Outcome of a policy evaluation. Precedence is `Block > Fail > Pass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Block,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Block => "block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPattern {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakers {
    pub max_containers: u32,
    pub max_cost_per_run_usd: f64,
    pub max_deploys_per_hour: u32,
    pub max_file_deletes_per_turn: u32,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_containers: 5,
            max_cost_per_run_usd: 10.0,
            max_deploys_per_hour: 3,
            max_file_deletes_per_turn: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardStops {
    pub commands: Vec<CommandPattern>,
    pub critical_paths: Vec<String>,
    pub circuit_breakers: CircuitBreakers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    pub auto_deploy_staging: f64,
    pub auto_promote_prod: f64,
    pub notify_human: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            auto_deploy_staging: 0.8,
            auto_promote_prod: 0.9,
            notify_human: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationChannel {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notifications {
    pub on_deploy: bool,
    pub on_block: bool,
    pub on_rollback: bool,
    pub channels: Vec<NotificationChannel>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            on_deploy: true,
            on_block: true,
            on_rollback: true,
            channels: vec![NotificationChannel {
                kind: "stdout".to_string(),
                webhook_url: None,
            }],
        }
    }
}

/// Parsed `policy.yaml`. Every section is optional and falls back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub version: String,
    pub hard_stops: HardStops,
    pub confidence_thresholds: ConfidenceThresholds,
    pub notifications: Notifications,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            hard_stops: HardStops::default(),
            confidence_thresholds: ConfidenceThresholds::default(),
            notifications: Notifications::default(),
        }
    }
}

impl Policy {
    pub fn from_yaml_str(contents: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit; treat it as "all defaults".
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Warnings for thresholds that are out of `[0, 1]` or misordered.
    ///
    /// Misordered thresholds can produce contradictory decisions; they are
    /// reported, never corrected.
    pub fn validate_thresholds(&self) -> Vec<String> {
        let t = &self.confidence_thresholds;
        let mut warnings = Vec::new();
        for (name, value) in [
            ("notify_human", t.notify_human),
            ("auto_deploy_staging", t.auto_deploy_staging),
            ("auto_promote_prod", t.auto_promote_prod),
        ] {
            if !(0.0..=1.0).contains(&value) {
                warnings.push(format!("{name} {value} is outside [0, 1]"));
            }
        }
        if t.notify_human > t.auto_deploy_staging {
            warnings.push(format!(
                "notify_human {} exceeds auto_deploy_staging {}",
                t.notify_human, t.auto_deploy_staging
            ));
        }
        if t.auto_deploy_staging > t.auto_promote_prod {
            warnings.push(format!(
                "auto_deploy_staging {} exceeds auto_promote_prod {}",
                t.auto_deploy_staging, t.auto_promote_prod
            ));
        }
        warnings
    }
}

/// Runtime facts checked against the policy. Missing facts default to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationInput {
    pub commands: Vec<String>,
    pub file_paths: Vec<String>,
    pub container_count: u32,
    pub cost_usd: f64,
    pub deploys_this_hour: u32,
    pub file_deletes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub breaker_violations: Vec<String>,
}

/// Critical-path glob compiled once at load.
#[derive(Debug, Clone)]
struct CriticalPath {
    raw: String,
    full: Pattern,
    /// Pattern after a leading `**/`, matched against every path suffix.
    suffix: Option<Pattern>,
}

impl CriticalPath {
    fn compile(raw: &str) -> Result<Self, ConfigError> {
        let compile = |pattern: &str| {
            Pattern::new(pattern).map_err(|err| ConfigError::InvalidGlob {
                pattern: raw.to_string(),
                message: err.to_string(),
            })
        };
        let suffix = match raw.strip_prefix("**/") {
            Some(rest) => Some(compile(rest)?),
            None => None,
        };
        Ok(Self {
            raw: raw.to_string(),
            full: compile(raw)?,
            suffix,
        })
    }

    fn matches(&self, file_path: &str) -> bool {
        if self.full.matches(file_path) {
            return true;
        }
        let Some(suffix) = &self.suffix else {
            return false;
        };
        if suffix.matches(file_path) {
            return true;
        }
        let normalized = file_path.replace('\\', "/");
        let parts: Vec<&str> = normalized.split('/').collect();
        (0..parts.len()).any(|start| suffix.matches(&parts[start..].join("/")))
    }
}

/// Evaluates commands, file paths and operational metrics against a policy.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policy: Policy,
    critical_paths: Vec<CriticalPath>,
    lowered_commands: Vec<(String, String)>,
}

impl PolicyEngine {
    /// Compile the policy. Invalid critical-path globs are rejected here so
    /// evaluation itself cannot fail.
    pub fn new(policy: Policy) -> Result<Self, ConfigError> {
        let critical_paths = policy
            .hard_stops
            .critical_paths
            .iter()
            .map(|raw| CriticalPath::compile(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let lowered_commands = policy
            .hard_stops
            .commands
            .iter()
            .map(|c| (c.pattern.clone(), c.pattern.to_lowercase()))
            .collect();
        Ok(Self {
            policy,
            critical_paths,
            lowered_commands,
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn evaluate(&self, input: &EvaluationInput) -> EvaluationResult {
        let mut reasons = Vec::new();
        let mut blocked_commands = Vec::new();
        let mut blocked_paths = Vec::new();
        let mut breaker_violations = Vec::new();

        for command in &input.commands {
            let lowered = command.to_lowercase();
            for (pattern, pattern_lower) in &self.lowered_commands {
                if lowered.contains(pattern_lower.as_str()) {
                    blocked_commands.push(command.clone());
                    reasons.push(format!(
                        "Hard stop: command '{command}' matches blocked pattern '{pattern}'"
                    ));
                }
            }
        }

        for file_path in &input.file_paths {
            for critical in &self.critical_paths {
                if critical.matches(file_path) {
                    blocked_paths.push(file_path.clone());
                    reasons.push(format!(
                        "Hard stop: path '{file_path}' matches critical pattern '{}'",
                        critical.raw
                    ));
                }
            }
        }

        let breakers = &self.policy.hard_stops.circuit_breakers;
        if input.container_count > breakers.max_containers {
            breaker_violations.push(format!(
                "Container count {} exceeds max {}",
                input.container_count, breakers.max_containers
            ));
        }
        if input.cost_usd > breakers.max_cost_per_run_usd {
            breaker_violations.push(format!(
                "Cost ${:.2} exceeds max ${:.2}",
                input.cost_usd, breakers.max_cost_per_run_usd
            ));
        }
        if input.deploys_this_hour > breakers.max_deploys_per_hour {
            breaker_violations.push(format!(
                "Deploys this hour ({}) exceeds max {}",
                input.deploys_this_hour, breakers.max_deploys_per_hour
            ));
        }
        if input.file_deletes > breakers.max_file_deletes_per_turn {
            breaker_violations.push(format!(
                "File deletes ({}) exceeds max {}",
                input.file_deletes, breakers.max_file_deletes_per_turn
            ));
        }
        reasons.extend(breaker_violations.iter().cloned());

        let verdict = if !blocked_commands.is_empty() || !blocked_paths.is_empty() {
            Verdict::Block
        } else if !breaker_violations.is_empty() {
            Verdict::Fail
        } else {
            Verdict::Pass
        };

        EvaluationResult {
            verdict,
            reasons,
            blocked_commands,
            blocked_paths,
            breaker_violations,
        }
    }

    pub fn should_auto_deploy_staging(&self, confidence: f64) -> bool {
        confidence >= self.policy.confidence_thresholds.auto_deploy_staging
    }

    pub fn should_auto_promote_prod(&self, confidence: f64) -> bool {
        confidence >= self.policy.confidence_thresholds.auto_promote_prod
    }

    pub fn should_notify_human(&self, confidence: f64) -> bool {
        confidence < self.policy.confidence_thresholds.notify_human
    }
}
