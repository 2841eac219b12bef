//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Lifecycle, shutdown, signal and health managers produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are cheap (atomic increments) and optional
//! - Module spans carry the module name into every event they enclose

pub mod logging;
pub mod metrics;
