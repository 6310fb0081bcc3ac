//! Aggregation of per-step agent results into a single confidence score.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::types::{AgentResult, Severity};

/// Default weight per step name.
pub const DEFAULT_WEIGHTS: [(&str, f64); 4] = [
    ("analyze", 0.25),
    ("test", 0.35),
    ("security", 0.20),
    ("verify", 0.20),
];

/// Weight for step names missing from the table.
pub const UNKNOWN_STEP_WEIGHT: f64 = 0.1;

const INCOMPLETE_PENALTY: f64 = 0.1;
const ERROR_MULTIPLIER: f64 = 0.8;

/// A named step result as fed to the scorer.
pub type StepResult<'a> = (&'a str, &'a AgentResult);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub score: f64,
    pub reason: String,
    pub step_scores: BTreeMap<String, f64>,
    pub has_critical: bool,
    pub has_errors: bool,
    pub incomplete_steps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    weights: HashMap<String, f64>,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::with_weights(
            DEFAULT_WEIGHTS
                .iter()
                .map(|(name, weight)| (name.to_string(), *weight)),
        )
    }
}

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the weight table entirely.
    pub fn with_weights(weights: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            weights: weights.into_iter().collect(),
        }
    }

    pub fn weight_for(&self, step: &str) -> f64 {
        self.weights
            .get(step)
            .copied()
            .unwrap_or(UNKNOWN_STEP_WEIGHT)
    }

    pub fn score(&self, results: &[StepResult<'_>]) -> ConfidenceScore {
        if results.is_empty() {
            return ConfidenceScore {
                score: 0.0,
                reason: "No agent results to score.".to_string(),
                step_scores: BTreeMap::new(),
                has_critical: false,
                has_errors: false,
                incomplete_steps: Vec::new(),
            };
        }

        let step_scores: BTreeMap<String, f64> = results
            .iter()
            .map(|(name, result)| (name.to_string(), result.confidence))
            .collect();
        let incomplete_steps: Vec<String> = results
            .iter()
            .filter(|(_, result)| !result.completed)
            .map(|(name, _)| name.to_string())
            .collect();
        let has_critical = results
            .iter()
            .any(|(_, result)| result.has_severity(Severity::Critical));
        let has_errors = results
            .iter()
            .any(|(_, result)| result.has_severity(Severity::Error));

        if has_critical {
            return ConfidenceScore {
                score: 0.0,
                reason: "Critical finding detected; deployment blocked.".to_string(),
                step_scores,
                has_critical,
                has_errors,
                incomplete_steps,
            };
        }

        let (weighted_sum, total_weight) =
            step_scores
                .iter()
                .fold((0.0, 0.0), |(sum, total), (name, confidence)| {
                    let weight = self.weight_for(name);
                    (sum + confidence * weight, total + weight)
                });
        let mut raw = if total_weight == 0.0 {
            0.0
        } else {
            weighted_sum / total_weight
        };

        if !incomplete_steps.is_empty() {
            raw = (raw - INCOMPLETE_PENALTY * incomplete_steps.len() as f64).max(0.0);
        }
        if has_errors {
            raw *= ERROR_MULTIPLIER;
        }
        let score = round4(raw.clamp(0.0, 1.0));

        let mut reasons = Vec::new();
        if !incomplete_steps.is_empty() {
            reasons.push(format!("Incomplete steps: {}", incomplete_steps.join(", ")));
        }
        if has_errors {
            reasons.push("Non-critical errors detected (20% penalty)".to_string());
        }
        if reasons.is_empty() {
            reasons.push(format!("All steps completed. Weighted score: {score:?}"));
        }

        ConfidenceScore {
            score,
            reason: reasons.join("; "),
            step_scores,
            has_critical,
            has_errors,
            incomplete_steps,
        }
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
