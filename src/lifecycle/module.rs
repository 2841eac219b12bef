//! The contract every orchestrated module implements.

use async_trait::async_trait;
use serde::Serialize;
use std::time::SystemTime;

use crate::lifecycle::context::Context;

/// Error type returned by module implementations.
pub type ModuleError = Box<dyn std::error::Error + Send + Sync>;

/// A named unit of the service that the `Starter` initializes, starts,
/// health-checks and stops.
///
/// Implementations use interior mutability: the starter only ever holds an
/// `Arc<dyn Module>`. Context cancellation is cooperative; long-running work
/// should select on `ctx.done()`.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Prepare resources. `span` carries the module's name as a field and
    /// should be used to instrument the module's own logging.
    async fn initialize(&self, ctx: &Context, span: tracing::Span) -> Result<(), ModuleError>;

    /// Begin operation.
    async fn start(&self, ctx: &Context) -> Result<(), ModuleError>;

    /// Stop operation and release resources.
    async fn stop(&self, ctx: &Context) -> Result<(), ModuleError>;

    /// Report whether the module is working.
    async fn health_check(&self, ctx: &Context) -> Result<(), ModuleError>;
}

/// Lifecycle state of a single module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Registered,
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleState::Registered => "registered",
            ModuleState::Initializing => "initializing",
            ModuleState::Running => "running",
            ModuleState::Stopping => "stopping",
            ModuleState::Stopped => "stopped",
            ModuleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status record kept by the starter for each registered module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub state: ModuleState,
    /// Set when initialization begins.
    pub start_time: Option<SystemTime>,
    /// Last error message, if the module failed.
    pub error: Option<String>,
}

impl ModuleStatus {
    pub(crate) fn registered(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ModuleState::Registered,
            start_time: None,
            error: None,
        }
    }
}
