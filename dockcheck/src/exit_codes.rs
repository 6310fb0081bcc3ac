//! Stable exit codes for dockcheck CLI commands.

use crate::core::policy::Verdict;
use crate::core::types::Decision;

/// Policy passed, or the pipeline decided to deploy.
pub const PASS: i32 = 0;
/// Breaker violation, human review required, or a load/config error.
pub const FAIL: i32 = 1;
/// Hard stop or blocked pipeline.
pub const BLOCK: i32 = 2;

pub fn for_verdict(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Pass => PASS,
        Verdict::Fail => FAIL,
        Verdict::Block => BLOCK,
    }
}

pub fn for_decision(decision: Decision) -> i32 {
    match decision {
        Decision::Deploy => PASS,
        Decision::Notify => FAIL,
        Decision::Block => BLOCK,
    }
}
