//! Test-only dispatchers, notifiers and fixtures.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::agent::{AgentKind, DispatchRequest};
use crate::core::types::{ActionNeeded, AgentResult, StepConfig};
use crate::error::DispatchError;
use crate::io::dispatch::Dispatcher;
use crate::io::notify::{Notifier, NotifyContext, NotifyEvent};

/// One canned answer of a [`ScriptedDispatcher`].
#[derive(Debug, Clone)]
pub enum ScriptedDispatch {
    Result(AgentResult),
    Error(DispatchError),
    /// Sleep before answering, to exercise concurrency.
    Delayed(Duration, AgentResult),
}

#[derive(Debug, Default)]
struct Script {
    answers: HashMap<String, VecDeque<ScriptedDispatch>>,
    calls: HashMap<String, usize>,
    requests: Vec<DispatchRequest>,
}

/// Dispatcher answering from a script keyed by request label (step name or
/// task id). Answers are consumed in order; the last one repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDispatcher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, label: &str, answer: ScriptedDispatch) -> Self {
        self.with_sequence(label, vec![answer])
    }

    pub fn with_sequence(self, label: &str, answers: Vec<ScriptedDispatch>) -> Self {
        lock(&self.script)
            .answers
            .insert(label.to_string(), answers.into());
        self
    }

    pub fn calls(&self, label: &str) -> usize {
        lock(&self.script).calls.get(label).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.script).requests.len()
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        lock(&self.script).requests.clone()
    }

    fn next_answer(&self, request: &DispatchRequest) -> Option<ScriptedDispatch> {
        let mut script = lock(&self.script);
        script.requests.push(request.clone());
        *script.calls.entry(request.label.clone()).or_default() += 1;
        let queue = script.answers.get_mut(&request.label)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<AgentResult, DispatchError> {
        match self.next_answer(request) {
            Some(ScriptedDispatch::Result(result)) => Ok(result),
            Some(ScriptedDispatch::Error(err)) => Err(err),
            Some(ScriptedDispatch::Delayed(delay, result)) => {
                tokio::time::sleep(delay).await;
                Ok(result)
            }
            None => Err(DispatchError::Io {
                agent: request.agent,
                message: format!("no scripted answer for '{}'", request.label),
            }),
        }
    }
}

/// Notifier that keeps every notification for later assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<(NotifyEvent, String, NotifyContext)>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(NotifyEvent, String, NotifyContext)> {
        lock(&self.events).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()> {
        lock(&self.events).push((event, message.to_string(), context.clone()));
        Ok(())
    }
}

/// Notifier whose delivery always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, _event: NotifyEvent, _message: &str, _context: &NotifyContext) -> Result<()> {
        Err(anyhow!("notification channel unavailable"))
    }
}

/// Claude step named after its skill, with default limits.
pub fn step(name: &str, depends_on: &[&str]) -> StepConfig {
    StepConfig {
        name: name.to_string(),
        skill: name.to_string(),
        agent: AgentKind::Claude,
        max_turns: 10,
        timeout_secs: 300,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        parallel_group: None,
    }
}

/// Completed result with the given confidence and no findings.
pub fn agent_result(confidence: f64) -> AgentResult {
    AgentResult {
        completed: true,
        confidence,
        turns_used: 1,
        summary: "ok".to_string(),
        findings: Vec::new(),
        action_needed: ActionNeeded::None,
    }
}

/// Executable `sh` script standing in for an agent CLI. The directory is
/// removed on drop.
pub struct AgentScript {
    _dir: TempDir,
    path: PathBuf,
}

impl AgentScript {
    pub fn program(&self) -> String {
        self.path.display().to_string()
    }
}

/// Write `body` as an executable `#!/bin/sh` script.
#[cfg(unix)]
pub fn agent_script(body: &str) -> Result<AgentScript> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().context("create script dir")?;
    let path = dir.path().join("agent.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(AgentScript { _dir: dir, path })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
