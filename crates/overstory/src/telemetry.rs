//! Tracing subscriber setup for embedding binaries.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info` for this crate.
/// Calling this twice is a no-op: the second install attempt is discarded
/// so tests and embedders cannot trip over each other.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("overstory=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
