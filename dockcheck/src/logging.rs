//! Diagnostic tracing for dockcheck.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Product output
//! (verdicts, plans, notifications) goes to stdout and is unaffected by it.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=dockcheck=debug dockcheck run --pipeline pipeline.yaml
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
