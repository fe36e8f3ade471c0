//! Shared test harness bits. Not part of the public API.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize `tracing` once per test binary, so `#[tracing::instrument]`
/// spans show up when a test is run with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("e2ee_service=debug")),
            )
            .try_init();
    });
}
