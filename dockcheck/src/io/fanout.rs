//! Bounded fan-out of independent agent tasks with order-preserving fan-in.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::core::agent::{AgentKind, DispatchRequest};
use crate::core::metrics::MetricsCollector;
use crate::core::types::AgentResult;
use crate::io::dispatch::Dispatcher;

pub const DEFAULT_MAX_CONCURRENT: usize = 5;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex should compile")
});

/// One independent unit of fan-out work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelTask {
    pub task_id: String,
    #[serde(default)]
    pub agent: AgentKind,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_turns() -> u32 {
    10
}

fn default_timeout_secs() -> u64 {
    300
}

impl ParallelTask {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent: AgentKind::default(),
            prompt: prompt.into(),
            system_prompt: None,
            max_turns: default_max_turns(),
            timeout_secs: default_timeout_secs(),
        }
    }

    fn request(&self) -> DispatchRequest {
        DispatchRequest {
            agent: self.agent,
            label: self.task_id.clone(),
            prompt: self.prompt.clone(),
            system_prompt: self.system_prompt.clone(),
            max_turns: self.max_turns,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Outcome of one task. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelResult {
    pub task_id: String,
    pub result: Option<AgentResult>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanOutResult {
    /// In task input order.
    pub results: Vec<ParallelResult>,
    pub total_elapsed: Duration,
    pub all_completed: bool,
    pub failed_tasks: Vec<String>,
}

impl FanOutResult {
    pub fn success_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.result.as_ref().is_some_and(|res| res.completed))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

/// Runs many dispatches concurrently, at most `max_concurrent` at a time.
pub struct ParallelDispatcher<D> {
    dispatcher: D,
    metrics: Option<Arc<MetricsCollector>>,
    max_concurrent: usize,
}

impl<D: Dispatcher> ParallelDispatcher<D> {
    pub fn new(dispatcher: D) -> Self {
        Self {
            dispatcher,
            metrics: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Record turns of every successful task under its task id.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Concurrency bound used by [`Self::fan_out_services`]. Zero is treated as one.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Dispatch every task and wait for all of them.
    ///
    /// A failing task is captured in its [`ParallelResult::error`] and never
    /// cancels its siblings.
    #[instrument(skip_all, fields(tasks = tasks.len(), max_concurrent = max_concurrent))]
    pub async fn fan_out(&self, tasks: Vec<ParallelTask>, max_concurrent: usize) -> FanOutResult {
        let start = Instant::now();
        let semaphore = Semaphore::new(max_concurrent.max(1));

        let results = join_all(tasks.iter().map(|task| self.run_task(task, &semaphore))).await;

        let failed_tasks: Vec<String> = results
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.task_id.clone())
            .collect();
        let all_completed = failed_tasks.is_empty()
            && results
                .iter()
                .all(|r| r.result.as_ref().is_some_and(|res| res.completed));

        let total_elapsed = start.elapsed();
        info!(
            failed = failed_tasks.len(),
            all_completed,
            elapsed_ms = total_elapsed.as_millis() as u64,
            "fan-out finished"
        );
        FanOutResult {
            results,
            total_elapsed,
            all_completed,
            failed_tasks,
        }
    }

    /// Run the same templated prompt once per service.
    ///
    /// `{field}` placeholders are filled from the service map; `{{` and `}}`
    /// are literal braces. The task id is the service's `name`, else its
    /// `path`, else `unknown`. A placeholder with no matching field fails the
    /// whole call before anything is dispatched.
    pub async fn fan_out_services(
        &self,
        services: &[BTreeMap<String, String>],
        template: &str,
        agent: AgentKind,
        max_turns: u32,
    ) -> Result<FanOutResult> {
        let mut tasks = Vec::with_capacity(services.len());
        for service in services {
            let task_id = service
                .get("name")
                .or_else(|| service.get("path"))
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let prompt = match render_placeholders(template, service) {
                Ok(prompt) => prompt,
                Err(field) => bail!("service '{task_id}': template references unknown field '{field}'"),
            };
            tasks.push(ParallelTask {
                agent,
                max_turns,
                ..ParallelTask::new(task_id, prompt)
            });
        }
        Ok(self.fan_out(tasks, self.max_concurrent).await)
    }

    async fn run_task(&self, task: &ParallelTask, semaphore: &Semaphore) -> ParallelResult {
        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                return ParallelResult {
                    task_id: task.task_id.clone(),
                    result: None,
                    error: Some(err.to_string()),
                    elapsed: Duration::ZERO,
                };
            }
        };

        let started = Instant::now();
        let outcome = self.dispatcher.dispatch(&task.request()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(result) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_turns(&task.task_id, result.turns_used);
                }
                ParallelResult {
                    task_id: task.task_id.clone(),
                    result: Some(result),
                    error: None,
                    elapsed,
                }
            }
            Err(err) => {
                warn!(task_id = %task.task_id, err = %err, "fan-out task failed");
                ParallelResult {
                    task_id: task.task_id.clone(),
                    result: None,
                    error: Some(err.to_string()),
                    elapsed,
                }
            }
        }
    }
}

/// Fill `{field}` placeholders; returns the first unknown field name on failure.
fn render_placeholders(
    template: &str,
    fields: &BTreeMap<String, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        match caps.get(1) {
            Some(name) => match fields.get(name.as_str()) {
                Some(value) => out.push_str(value),
                None => return Err(name.as_str().to_string()),
            },
            None => out.push_str(&whole.as_str()[..1]),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}
