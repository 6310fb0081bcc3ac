//! Supported agent CLIs and their invocation conventions.
//!
//! Each [`AgentKind`] owns its argv layout and its stdout parser, so adding a
//! CLI means adding a variant and the compiler points at every match that
//! needs a case.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::parse::{parse_claude_output, parse_codex_output};
use crate::core::types::AgentResult;

/// Codex approval level used for unattended pipeline runs.
const CODEX_APPROVAL_MODE: &str = "full-auto";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Claude Code in headless print mode.
    #[default]
    Claude,
    /// OpenAI Codex CLI in quiet mode.
    Codex,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }

    /// Executable looked up on `PATH` unless the dispatcher overrides it.
    pub fn default_program(self) -> &'static str {
        self.as_str()
    }

    /// Arguments (excluding the program) for one invocation.
    pub fn build_args(self, request: &DispatchRequest) -> Vec<String> {
        match self {
            AgentKind::Claude => {
                let mut args = vec![
                    "--print".to_string(),
                    "--output-format".to_string(),
                    "json".to_string(),
                    "--max-turns".to_string(),
                    request.max_turns.to_string(),
                ];
                if let Some(system_prompt) = request
                    .system_prompt
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                {
                    args.push("--system-prompt".to_string());
                    args.push(system_prompt.to_string());
                }
                args.push(request.prompt.clone());
                args
            }
            // Codex has no turn limit or system prompt flag.
            AgentKind::Codex => vec![
                "--quiet".to_string(),
                "--approval-mode".to_string(),
                CODEX_APPROVAL_MODE.to_string(),
                request.prompt.clone(),
            ],
        }
    }

    /// Turn captured stdout/stderr into a result. Never fails.
    pub fn parse_output(self, stdout: &str, stderr: &str) -> AgentResult {
        match self {
            AgentKind::Claude => parse_claude_output(stdout, stderr),
            AgentKind::Codex => parse_codex_output(stdout, stderr),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a single agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub agent: AgentKind,
    /// Step name or fan-out task id; used for logs and scripted test dispatchers.
    pub label: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_turns: u32,
    pub timeout: Duration,
}
