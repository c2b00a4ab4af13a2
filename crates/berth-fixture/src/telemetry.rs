//! Tracing setup for test binaries.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{FixtureError, Result};

/// Installs a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns an error
/// if a subscriber is already installed, which tests calling this from
/// several places can ignore.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| FixtureError::configuration(format!("failed to parse log filter: {}", e)))?;

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
    };

    installed.map_err(|e| FixtureError::configuration(format!("failed to initialize tracing: {}", e)))
}
