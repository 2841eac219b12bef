//! Service lifecycle orchestration.
//!
//! Ordered module startup, phased graceful shutdown, OS signal dispatch and
//! concurrent health monitoring behind one state machine
//! ([`LifecycleManager`]).

pub mod config;
pub mod health;
pub mod lifecycle;
pub mod modules;
pub mod observability;
pub mod resilience;

pub use config::schema::ServiceConfig;
pub use lifecycle::{Context, LifecycleManager, LifecycleState, Module};
