//! Test log capture.
//!
//! Events go through the libtest writer, so they only show for failing tests
//! or with `--nocapture`. The first call in a process wins.

use tracing_subscriber::EnvFilter;

/// Queue, limiter and dispatcher events at debug, everything else at warn.
pub const DEFAULT_TEST_FILTER: &str = "warn,nurture_core=debug";

/// Capture events with `RUST_LOG`, or [`DEFAULT_TEST_FILTER`] when unset.
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_TEST_FILTER);
}

/// Like [`init_test_tracing`] with an explicit fallback filter.
pub fn init_test_tracing_with(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .try_init();
}
