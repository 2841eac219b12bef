//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber
//! - Pick the filter from `RUST_LOG`, the CLI override or config, in that order
//!
//! # Design Decisions
//! - JSON format for production, pretty format for development
//! - Installing twice is an error rather than a silent no-op

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter. `RUST_LOG` wins over `level_override`, which wins over
/// the configured level.
pub fn build_filter(
    config: &ObservabilityConfig,
    level_override: Option<&str>,
) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let level = level_override.unwrap_or(config.log_level.as_str());
    EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
        filter: level.to_string(),
        source,
    })
}

/// Install the global subscriber.
pub fn init_logging(
    config: &ObservabilityConfig,
    level_override: Option<&str>,
) -> Result<(), LoggingError> {
    let filter = build_filter(config, level_override)?;

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_is_used_without_rust_log() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = ObservabilityConfig::default();
        let filter = build_filter(&config, Some("debug")).unwrap();
        assert_eq!(filter.to_string(), "debug");

        let filter = build_filter(&config, None).unwrap();
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = ObservabilityConfig::default();
        let err = build_filter(&config, Some("lifecycle=notalevel")).unwrap_err();
        assert!(err.to_string().contains("invalid log filter"));
    }
}
