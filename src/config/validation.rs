//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, buffer sizes > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ServiceConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is not a valid socket address: '{value}'")]
    InvalidAddress { field: &'static str, value: String },
}

pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut non_zero = |field: &'static str, value: u64| {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    };

    non_zero("lifecycle.shutdown_timeout_secs", config.lifecycle.shutdown_timeout_secs);

    non_zero("shutdown.default_timeout_ms", config.shutdown.default_timeout_ms);
    let phases = &config.shutdown.phase_timeouts;
    for (field, value) in [
        ("shutdown.phase_timeouts.pre_ms", phases.pre_ms),
        ("shutdown.phase_timeouts.main_ms", phases.main_ms),
        ("shutdown.phase_timeouts.post_ms", phases.post_ms),
    ] {
        if let Some(ms) = value {
            non_zero(field, ms);
        }
    }

    non_zero("signals.graceful_timeout_ms", config.signals.graceful_timeout_ms);
    non_zero("signals.force_timeout_ms", config.signals.force_timeout_ms);
    non_zero("signals.buffer_size", config.signals.buffer_size as u64);

    non_zero("health.check_interval_secs", config.health.check_interval_secs);
    non_zero("health.timeout_ms", config.health.timeout_ms);

    if config.heartbeat.enabled {
        non_zero("heartbeat.interval_ms", config.heartbeat.interval_ms);
        non_zero("heartbeat.stall_ticks", config.heartbeat.stall_ticks as u64);
    }

    if config.observability.log_level.trim().is_empty() {
        errors.push(ValidationError::Empty {
            field: "observability.log_level",
        });
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
