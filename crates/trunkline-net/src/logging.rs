//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber with the given default filter.
///
/// `RUST_LOG` overrides the default. Safe to call more than once; later
/// calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
