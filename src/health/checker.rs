//! Health checker contract and result types.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::lifecycle::context::Context;
use crate::lifecycle::module::Module;

/// Health state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Latest health result of one component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_check: Option<SystemTime>,
    pub response_time: Duration,
    pub details: HashMap<String, String>,
}

impl HealthCheckResult {
    pub fn healthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, message)
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, message)
    }

    /// The "not checked yet" placeholder seeded at registration.
    pub fn unknown(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unknown, "not checked yet")
    }

    fn with_status(component: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message: message.into(),
            last_check: None,
            response_time: Duration::ZERO,
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// A component the health manager can probe.
#[async_trait]
pub trait HealthChecker: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Probe the component. Timing and `last_check` are filled in by the
    /// manager.
    async fn health_check(&self, ctx: &Context) -> HealthCheckResult;
}

/// Exposes a [`Module`]'s health check as a [`HealthChecker`].
pub struct ModuleChecker {
    module: Arc<dyn Module>,
}

impl ModuleChecker {
    pub fn new(module: Arc<dyn Module>) -> Self {
        Self { module }
    }
}

#[async_trait]
impl HealthChecker for ModuleChecker {
    fn name(&self) -> &str {
        self.module.name()
    }

    async fn health_check(&self, ctx: &Context) -> HealthCheckResult {
        match self.module.health_check(ctx).await {
            Ok(()) => HealthCheckResult::healthy(self.name(), "module healthy"),
            Err(e) => HealthCheckResult::unhealthy(self.name(), e.to_string()),
        }
    }
}
