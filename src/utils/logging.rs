//! Structured logging setup.
//!
//! The crate itself only emits `tracing` events. Binaries and tests that want
//! to see them call [`init_logging`] once; later calls are no-ops.

use crate::config::LoggingConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber configured from `config`.
///
/// `RUST_LOG` takes precedence over the configured level when it is set.
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!(app = %config.app_name, "Logging initialized");
    }
    installed
}
