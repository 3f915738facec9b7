//! Logging configuration

use crate::error::ControllerError;
use pxe_server::config::LogConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// `RUST_LOG` takes precedence over `log.level`.
pub fn init_logging(options: &LogConfig) -> Result<(), ControllerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&options.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if options.json {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ControllerError::Configuration(e.to_string()))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ControllerError::Configuration(e.to_string()))?;
    }

    Ok(())
}
