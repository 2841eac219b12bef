//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown step / signal handler / module stop / health check:
//!     → timeouts.rs (spawn as a task, race it against its Context)
//!     → Outcome: Completed | DeadlineExceeded | Cancelled | Panicked
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every unit of orchestrated work has a deadline
//! - A panic in one unit is reported, never propagated to the orchestrator

pub mod timeouts;
