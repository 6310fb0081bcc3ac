//! Run metrics and per-skill turn history.
//!
//! [`MetricsCollector`] is the only mutable state shared between concurrent
//! dispatches. It is created by the caller and passed around behind an `Arc`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

const MIN_SAMPLES: usize = 3;
const HEADROOM: f64 = 1.5;
const MIN_SUGGESTED_TURNS: u32 = 3;
const MAX_SUGGESTED_TURNS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TurnStats {
    pub count: usize,
    pub avg_turns: f64,
    pub min_turns: u32,
    pub max_turns: u32,
    pub suggested_max: u32,
}

/// Turn usage history keyed by skill (or fan-out task id).
#[derive(Debug, Clone, Default)]
pub struct TurnTracker {
    history: BTreeMap<String, Vec<u32>>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, skill: &str, turns_used: u32) {
        self.history
            .entry(skill.to_string())
            .or_default()
            .push(turns_used);
    }

    /// `default` until three samples exist, then 1.5x the mean clamped to `[3, 50]`.
    pub fn suggested_max_turns(&self, skill: &str, default: u32) -> u32 {
        let history = self.history(skill);
        if history.len() < MIN_SAMPLES {
            return default;
        }
        let suggested = (mean(&history) * HEADROOM).floor() as u32;
        suggested.clamp(MIN_SUGGESTED_TURNS, MAX_SUGGESTED_TURNS)
    }

    pub fn history(&self, skill: &str) -> Vec<u32> {
        self.history.get(skill).cloned().unwrap_or_default()
    }

    pub fn stats(&self) -> BTreeMap<String, TurnStats> {
        self.history
            .iter()
            .filter(|(_, turns)| !turns.is_empty())
            .map(|(skill, turns)| {
                let stats = TurnStats {
                    count: turns.len(),
                    avg_turns: round_to(mean(turns), 1),
                    min_turns: turns.iter().copied().min().unwrap_or_default(),
                    max_turns: turns.iter().copied().max().unwrap_or_default(),
                    suggested_max: self.suggested_max_turns(skill, 10),
                };
                (skill.clone(), stats)
            })
            .collect()
    }
}

/// Metrics for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub run_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub confidence: f64,
    pub deployed: bool,
    pub blocked: bool,
    pub total_turns: u32,
    pub step_count: usize,
    pub elapsed: Duration,
    /// Step name to confidence.
    pub steps: BTreeMap<String, f64>,
}

impl RunMetrics {
    /// Empty record stamped with the current time.
    pub fn started_now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            run_id: format!("run-{}", now.as_millis()),
            timestamp: now.as_secs_f64(),
            confidence: 0.0,
            deployed: false,
            blocked: false,
            total_turns: 0,
            step_count: 0,
            elapsed: Duration::ZERO,
            steps: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_runs: usize,
    pub avg_confidence: f64,
    pub deploy_count: usize,
    pub block_count: usize,
    pub deploy_rate: f64,
    pub turn_stats: BTreeMap<String, TurnStats>,
}

/// Append-only run log plus turn tracker, safe to share across tasks.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    runs: Mutex<Vec<RunMetrics>>,
    turns: Mutex<TurnTracker>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, metrics: RunMetrics) {
        lock(&self.runs).push(metrics);
    }

    pub fn record_turns(&self, skill: &str, turns_used: u32) {
        lock(&self.turns).record(skill, turns_used);
    }

    pub fn suggested_max_turns(&self, skill: &str, default: u32) -> u32 {
        lock(&self.turns).suggested_max_turns(skill, default)
    }

    /// Snapshot of the turn tracker.
    pub fn turn_tracker(&self) -> TurnTracker {
        lock(&self.turns).clone()
    }

    pub fn runs(&self) -> Vec<RunMetrics> {
        lock(&self.runs).clone()
    }

    pub fn summary(&self) -> MetricsSummary {
        let runs = lock(&self.runs);
        let turn_stats = lock(&self.turns).stats();
        if runs.is_empty() {
            return MetricsSummary {
                total_runs: 0,
                avg_confidence: 0.0,
                deploy_count: 0,
                block_count: 0,
                deploy_rate: 0.0,
                turn_stats,
            };
        }
        let total = runs.len();
        let deploy_count = runs.iter().filter(|r| r.deployed).count();
        let block_count = runs.iter().filter(|r| r.blocked).count();
        let confidence_sum: f64 = runs.iter().map(|r| r.confidence).sum();
        MetricsSummary {
            total_runs: total,
            avg_confidence: round_to(confidence_sum / total as f64, 3),
            deploy_count,
            block_count,
            deploy_rate: round_to(deploy_count as f64 / total as f64, 3),
            turn_stats,
        }
    }
}

// A panic while holding the lock leaves plain data behind; keep using it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mean(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| f64::from(*v)).sum::<f64>() / values.len() as f64
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
