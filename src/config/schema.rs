//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::lifecycle::shutdown::ShutdownPhase;

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Top-level state machine settings.
    pub lifecycle: LifecycleConfig,

    /// Shutdown pipeline settings.
    pub shutdown: ShutdownConfig,

    /// OS signal handling settings.
    pub signals: SignalConfig,

    /// Health monitoring settings.
    pub health: HealthConfig,

    /// Built-in heartbeat module.
    pub heartbeat: HeartbeatConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Overall deadline for a signal- or error-triggered stop, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl LifecycleConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 60,
        }
    }
}

/// Per-phase deadlines. A missing value falls back to the default timeout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub pre_ms: Option<u64>,
    pub main_ms: Option<u64>,
    pub post_ms: Option<u64>,
}

/// Shutdown manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for steps and phases without their own, in milliseconds.
    pub default_timeout_ms: u64,

    /// Phase-specific deadlines.
    pub phase_timeouts: PhaseTimeouts,

    /// Run the steps of a phase concurrently instead of in priority order.
    pub parallel_execution: bool,

    /// Grace period to wait for timed-out steps after the last phase, in
    /// milliseconds. Zero returns immediately.
    pub force_kill_after_ms: u64,

    /// When false, only required steps run; the rest are recorded as skipped.
    pub enable_graceful: bool,

    /// Log each step at info level (debug otherwise).
    pub log_steps: bool,
}

impl ShutdownConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Deadline for a whole phase.
    pub fn phase_timeout(&self, phase: ShutdownPhase) -> Duration {
        let ms = match phase {
            ShutdownPhase::Pre => self.phase_timeouts.pre_ms,
            ShutdownPhase::Main => self.phase_timeouts.main_ms,
            ShutdownPhase::Post => self.phase_timeouts.post_ms,
        };
        ms.map(Duration::from_millis)
            .unwrap_or_else(|| self.default_timeout())
    }

    pub fn force_kill_after(&self) -> Duration {
        Duration::from_millis(self.force_kill_after_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            phase_timeouts: PhaseTimeouts::default(),
            parallel_execution: false,
            force_kill_after_ms: 5_000,
            enable_graceful: true,
            log_steps: true,
        }
    }
}

/// Signal manager configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Watch SIGTERM and SIGINT.
    pub enable_graceful: bool,

    /// Watch SIGQUIT.
    pub enable_force: bool,

    /// Watch SIGHUP.
    pub enable_reload: bool,

    /// Handler deadline for graceful signals, in milliseconds.
    pub graceful_timeout_ms: u64,

    /// Handler deadline for the force signal, in milliseconds.
    pub force_timeout_ms: u64,

    /// Capacity of the signal history ring.
    pub buffer_size: usize,

    /// Log every received signal.
    pub enable_logging: bool,
}

impl SignalConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn force_timeout(&self) -> Duration {
        Duration::from_millis(self.force_timeout_ms)
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enable_graceful: true,
            enable_force: true,
            enable_reload: false,
            graceful_timeout_ms: 30_000,
            force_timeout_ms: 5_000,
            buffer_size: 100,
            enable_logging: true,
        }
    }
}

/// Health manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval of the periodic health monitor, in seconds.
    pub check_interval_secs: u64,

    /// Deadline for each checker, in milliseconds.
    pub timeout_ms: u64,
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            timeout_ms: 5_000,
        }
    }
}

/// Built-in heartbeat module configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Register the heartbeat module in the daemon binary.
    pub enabled: bool,

    /// Tick interval in milliseconds.
    pub interval_ms: u64,

    /// Missed ticks tolerated before the module reports unhealthy.
    pub stall_ticks: u32,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            stall_ticks: 3,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty output for development, JSON for production.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
