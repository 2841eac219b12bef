//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML), optional
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated)
//!     → sections handed to each manager at construction
//!
//! At runtime:
//!     SignalManager::update_config swaps its section atomically
//!     ShutdownManager::update_config replaces its section under a lock
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Durations are stored as integer `_ms` / `_secs` fields with accessors

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::{
    HealthConfig, HeartbeatConfig, LifecycleConfig, LogFormat, ObservabilityConfig,
    PhaseTimeouts, ServiceConfig, ShutdownConfig, SignalConfig,
};
pub use validation::{validate_config, ValidationError};
