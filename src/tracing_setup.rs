//! Logging setup
//!
//! `RUST_LOG` controls filtering (default: info). Safe to call more than once;
//! later calls are no-ops.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();

    if result.is_ok() {
        tracing::debug!(version = env!("CARGO_PKG_VERSION"), "Tracing initialized");
    }
}
