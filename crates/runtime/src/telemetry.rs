//! Tracing subscriber setup for binaries and tests embedding the runtime.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a console subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Returns false when a global subscriber already exists,
/// so calling it twice is harmless.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .try_init()
        .is_ok()
}
