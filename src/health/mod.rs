//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (manager.rs):
//!     HealthChecker registered
//!     → Result seeded as Unknown ("not checked yet")
//!
//! Checks (manager.rs → checker.rs):
//!     perform_all_health_checks
//!     → One task per checker, each under its own timeout
//!     → Timeout / panic becomes Unhealthy
//!     → Latest result stored per component
//!
//! System snapshot (system.rs):
//!     /proc + Tokio runtime counters → SystemHealthSnapshot
//!
//! Summary:
//!     No components → Unknown
//!     All Healthy   → Healthy
//!     Otherwise     → Unhealthy
//! ```
//!
//! # Design Decisions
//! - Only the latest result per component is kept
//! - Unknown counts against overall health
//! - The system snapshot is informational and never fails

pub mod checker;
pub mod manager;
pub mod system;

pub use checker::{HealthCheckResult, HealthChecker, HealthStatus, ModuleChecker};
pub use manager::{HealthError, HealthManager, HealthSummary};
