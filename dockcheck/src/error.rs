//! Typed errors the orchestrator distinguishes.
//!
//! Loading and CLI plumbing use `anyhow`; these enums exist where callers need
//! to match on the failure kind.

use std::time::Duration;

use thiserror::Error;

use crate::core::agent::AgentKind;

/// Invalid pipeline or policy definition. Raised before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cyclic dependency detected among steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("invalid critical path glob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },
}

/// Failure to obtain any usable output from an agent CLI.
///
/// The orchestrator converts these into failed step results; they never
/// escape a single step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{agent} CLI not found; ensure '{program}' is installed and on PATH")]
    NotFound { agent: AgentKind, program: String },

    #[error("{agent} timed out after {}s", .timeout.as_secs())]
    Timeout { agent: AgentKind, timeout: Duration },

    #[error("{agent} exited with code {code:?}; stderr={stderr}")]
    NonZeroExit {
        agent: AgentKind,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected error dispatching {agent}: {message}")]
    Io { agent: AgentKind, message: String },
}
