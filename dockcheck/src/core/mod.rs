//! Deterministic, pure logic shared by the orchestrator and the CLI.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod agent;
pub mod confidence;
pub mod diff;
pub mod layers;
pub mod metrics;
pub mod parse;
pub mod policy;
pub mod types;
