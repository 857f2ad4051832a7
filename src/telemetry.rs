//! Tracing setup for the CLI.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Diagnostics go to stderr and are filtered by `DEBUSSY_LOG` (falling back
/// to `RUST_LOG`), defaulting to warnings only so the watcher's own progress
/// output stays readable.
pub fn init() {
    let filter = std::env::var("DEBUSSY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map_or_else(|_| EnvFilter::new("warn"), EnvFilter::new);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
