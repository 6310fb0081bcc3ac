//! Policy-gated deployment checks driven by AI agent CLIs.
//!
//! A pipeline of agent steps (analyze, test, security, ...) is layered by
//! dependency, dispatched to `claude` or `codex` subprocesses, and each step's
//! structured result is folded into a single confidence score. A declarative
//! policy of hard stops and circuit breakers can veto the run at any point.
//!
//! - **[`core`]**: Pure, deterministic logic (policy evaluation, scoring,
//!   layering, output parsing, metrics). No I/O.
//! - **[`io`]**: Side-effecting operations (config files, subprocesses,
//!   notifications). Isolated behind traits so tests can script them.
//!
//! [`orchestrator`] coordinates the two to run a pipeline end to end.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
