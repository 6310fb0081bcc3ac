//! Dispatcher abstraction for agent invocation.
//!
//! The [`Dispatcher`] trait decouples orchestration from the agent backend.
//! [`CliDispatcher`] spawns the real CLIs; tests use scripted dispatchers that
//! return predetermined results without spawning processes.

use std::collections::HashMap;
use std::future::Future;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::agent::{AgentKind, DispatchRequest};
use crate::core::parse::truncate_chars;
use crate::core::types::AgentResult;
use crate::error::DispatchError;
use crate::io::process::{ProcessOutput, run_with_timeout};

/// Default bound on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

const STDERR_EXCERPT_CHARS: usize = 300;

/// Abstraction over agent execution backends.
pub trait Dispatcher {
    /// Run one agent invocation. Unusable output is not an error; only a
    /// failure to obtain output at all is.
    fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> impl Future<Output = Result<AgentResult, DispatchError>> + Send;
}

/// Dispatcher that spawns the agent CLI as a subprocess.
#[derive(Debug, Clone)]
pub struct CliDispatcher {
    programs: HashMap<AgentKind, String>,
    output_limit_bytes: usize,
}

impl Default for CliDispatcher {
    fn default() -> Self {
        Self {
            programs: HashMap::new(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl CliDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `program` instead of the default executable for `agent`.
    pub fn with_program(mut self, agent: AgentKind, program: impl Into<String>) -> Self {
        self.programs.insert(agent, program.into());
        self
    }

    pub fn with_output_limit(mut self, output_limit_bytes: usize) -> Self {
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    pub fn program_for(&self, agent: AgentKind) -> &str {
        self.programs
            .get(&agent)
            .map(String::as_str)
            .unwrap_or_else(|| agent.default_program())
    }
}

impl Dispatcher for CliDispatcher {
    #[instrument(skip_all, fields(agent = %request.agent, label = %request.label, timeout_secs = request.timeout.as_secs()))]
    async fn dispatch(&self, request: &DispatchRequest) -> Result<AgentResult, DispatchError> {
        let agent = request.agent;
        let program = self.program_for(agent).to_string();
        let mut cmd = Command::new(&program);
        cmd.args(agent.build_args(request));
        let timeout = request.timeout;
        let limit = self.output_limit_bytes;

        info!(program = %program, "dispatching agent");
        let output = tokio::task::spawn_blocking(move || run_with_timeout(cmd, timeout, limit))
            .await
            .map_err(|err| DispatchError::Io {
                agent,
                message: err.to_string(),
            })?
            .map_err(|err| classify_run_error(agent, &program, &err))?;

        let result = interpret_output(agent, timeout, &output)?;
        info!(
            completed = result.completed,
            confidence = result.confidence,
            turns_used = result.turns_used,
            "agent finished"
        );
        Ok(result)
    }
}

fn classify_run_error(agent: AgentKind, program: &str, err: &anyhow::Error) -> DispatchError {
    match err.downcast_ref::<std::io::Error>() {
        Some(io) if io.kind() == std::io::ErrorKind::NotFound => {
            warn!(program, "agent CLI not found");
            DispatchError::NotFound {
                agent,
                program: program.to_string(),
            }
        }
        _ => DispatchError::Io {
            agent,
            message: format!("{err:#}"),
        },
    }
}

fn interpret_output(
    agent: AgentKind,
    timeout: Duration,
    output: &ProcessOutput,
) -> Result<AgentResult, DispatchError> {
    if output.timed_out {
        return Err(DispatchError::Timeout { agent, timeout });
    }
    let stdout = output.stdout_text();
    let stderr = output.stderr_text();
    if !output.status.success() {
        if stdout.trim().is_empty() {
            warn!(exit_code = ?output.status.code(), "agent exited without output");
            return Err(DispatchError::NonZeroExit {
                agent,
                code: output.status.code(),
                stderr: truncate_chars(&stderr, STDERR_EXCERPT_CHARS).to_string(),
            });
        }
        debug!(
            exit_code = ?output.status.code(),
            "agent exited non-zero with output; parsing anyway"
        );
    }
    debug!(stdout_len = stdout.len(), "parsing agent output");
    Ok(agent.parse_output(&stdout, &stderr))
}
