//! Ectobus Common Library
//!
//! Shared plumbing for the ectobus service crates:
//!
//! - [`config`] - Configuration loading (JSON5 format) and the [`ServiceConfig`] trait
//! - [`args`] - Common CLI arguments
//! - [`health`] - Device availability status
//! - [`error`] - Error types

pub mod args;
pub mod config;
pub mod error;
pub mod health;

pub use args::ServiceArgs;
pub use config::{LogFormat, LoggingConfig, ServiceConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use health::DeviceStatus;

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over `config.level` when it is set.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// # Example
///
/// ```ignore
/// use ectobus_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
