//! Tracing initialisation helper.
//!
//! The crate logs through the `tracing` macros and leaves subscriber wiring
//! to the embedding application. [`init`] is an opt-in convenience that
//! installs an env-filtered formatter, mainly for tests and small tools;
//! calling it when a subscriber is already installed is harmless.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber filtered by `RUST_LOG`. Repeated
/// or competing initialisation is ignored.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
