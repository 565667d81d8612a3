//! Structured logging initialisation

use classcast_core::{ClassroomError, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the configured filter. Calling this more than once is
/// harmless: later calls keep the first subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ClassroomError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| ClassroomError::Configuration {
            reason: format!("logging.filter is not a valid directive: {}", e),
        })?,
    };

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
    {
        tracing::debug!("Logging already initialised: {}", e);
    }
    Ok(())
}
