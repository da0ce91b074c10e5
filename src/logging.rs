//! Structured logging setup, ambient to every component regardless of which
//! features a given deployment's config enables or disables.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`
/// (falling back to `info`). Call once, at process start.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
