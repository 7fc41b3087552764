//! Diagnostic tracing for the `workflow` binary.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is never the record
//! of a run: checkpoints under `.workflow/runs/` and stage command logs under
//! `.workflow/logs/` are written regardless of the filter, and the CLI prints
//! run outcomes on stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber: `RUST_LOG` filter, compact lines on stderr.
///
/// Transition events carry `run_id`, `stage` and the retry counters, so
/// `RUST_LOG=workflow=info workflow resume <run-id>` traces a run step by step.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
