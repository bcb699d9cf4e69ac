//! Tracing setup for binaries and tests embedding the ledger

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `logging.filter`. Returns `false` when a
/// global subscriber was already installed, which is not an error.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
