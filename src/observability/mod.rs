//! Logging bootstrap.
//!
//! # Responsibilities
//! - Install a `tracing` subscriber once per process, honoring `RUST_LOG`
//!
//! # Design Decisions
//! - Init is idempotent so parallel test binaries and repeated harness
//!   construction never fight over the global subscriber

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install the global subscriber. Safe to call any number of times.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("proxy_harness=info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_test_writer()
            .try_init();
    });
}
