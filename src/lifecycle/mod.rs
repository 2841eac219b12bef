//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (manager.rs → startup.rs):
//!     Stopped → Starting
//!     → register signal handlers + shutdown pipeline
//!     → modules initialized and started in rank order (fail fast)
//!     → health monitor + signal listener
//!     → Running
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful stop
//!     SIGQUIT        → force shutdown
//!     SIGHUP         → reload handler, if one is registered
//!
//! Shutdown (manager.rs → shutdown.rs):
//!     Stopping → cancel root → stop listening
//!     → Pre:  stop-accepting-work
//!     → Main: stop-modules (reverse rank order, fail open)
//!     → Post: run-shutdown-hooks, cleanup
//!     → wait for internal tasks → Stopped
//! ```
//!
//! # Design Decisions
//! - Ordered startup and reverse-ordered shutdown from one registry
//! - Every phase, step, handler and module stop has a deadline
//! - Deadlines are cooperative; nothing is aborted

pub mod context;
pub mod manager;
pub mod module;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use context::Context;
pub use manager::{LifecycleError, LifecycleManager, LifecycleMetrics, LifecycleState};
pub use module::{Module, ModuleError, ModuleState, ModuleStatus};
pub use shutdown::{ShutdownError, ShutdownManager, ShutdownPhase, ShutdownResult, ShutdownStep, StepError};
pub use signals::{HandlerError, Signal, SignalError, SignalInfo, SignalManager, SignalType};
pub use startup::{Starter, StartupError, StartupMetrics};
