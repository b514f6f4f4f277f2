//! Structured logging setup.
//!
//! Console output through `tracing-subscriber` with an `EnvFilter`, so
//! `RUST_LOG=sluice_core=debug` works the usual way. Initialization is
//! guarded; calling it twice (tests, embedders with their own subscriber)
//! is harmless.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber once.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_level(true))
            .with(filter);

        // Another subscriber may already be installed by the host process.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}
