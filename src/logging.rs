//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; binaries and tests call
//! [`init`] once to print them. `RUST_LOG` takes precedence over the
//! configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Installs a formatted subscriber.
///
/// Returns `false` if a global subscriber was already installed, which is
/// harmless when several tests initialise logging.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level)),
        )
        .with_ansi(config.ansi)
        .with_target(false)
        .try_init()
        .is_ok()
}
