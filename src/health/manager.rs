//! Component health registry and aggregation.

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

use crate::config::HealthConfig;
use crate::health::checker::{HealthCheckResult, HealthChecker, HealthStatus};
use crate::health::system::{self, SystemHealthSnapshot};
use crate::lifecycle::context::Context;
use crate::observability::metrics;
use crate::resilience::timeouts::{run_with_deadline, Outcome};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health checker '{0}' not found")]
    CheckerNotFound(String),
}

/// Aggregate view over the stored component results.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall_status: HealthStatus,
    pub total_components: usize,
    pub healthy_components: usize,
    /// Components that are not healthy (unknown included), sorted by name.
    pub unhealthy_components: Vec<String>,
    /// Most recent check across all components.
    pub last_check: Option<SystemTime>,
    pub system_health: Option<SystemHealthSnapshot>,
    pub component_results: HashMap<String, HealthCheckResult>,
}

/// Registry of health checkers and their latest results.
pub struct HealthManager {
    checkers: RwLock<HashMap<String, Arc<dyn HealthChecker>>>,
    results: RwLock<HashMap<String, HealthCheckResult>>,
    system: RwLock<Option<SystemHealthSnapshot>>,
    timeout: RwLock<Duration>,
    check_interval: RwLock<Duration>,
    started: Instant,
}

impl HealthManager {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            checkers: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            system: RwLock::new(None),
            timeout: RwLock::new(config.timeout()),
            check_interval: RwLock::new(config.check_interval()),
            started: Instant::now(),
        }
    }

    /// Register (or replace) a checker and seed its result as unknown.
    pub fn register_checker(&self, checker: Arc<dyn HealthChecker>) {
        let name = checker.name().to_string();
        self.checkers.write().insert(name.clone(), checker);
        self.results
            .write()
            .insert(name.clone(), HealthCheckResult::unknown(&name));
        tracing::debug!(component = %name, "Health checker registered");
    }

    /// Remove a checker and its result. Returns whether it existed.
    pub fn unregister_checker(&self, name: &str) -> bool {
        let removed = self.checkers.write().remove(name).is_some();
        self.results.write().remove(name);
        removed
    }

    /// Run one checker and store its result.
    pub async fn perform_health_check(
        &self,
        ctx: &Context,
        name: &str,
    ) -> Result<HealthCheckResult, HealthError> {
        let checker = self
            .checkers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HealthError::CheckerNotFound(name.to_string()))?;

        let result = self.run_checker(ctx, name.to_string(), checker).await;
        self.store(std::slice::from_ref(&result));
        Ok(result)
    }

    /// Run every checker concurrently and store all results.
    pub async fn perform_all_health_checks(&self, ctx: &Context) -> HashMap<String, HealthCheckResult> {
        let checkers: Vec<(String, Arc<dyn HealthChecker>)> = self
            .checkers
            .read()
            .iter()
            .map(|(name, checker)| (name.clone(), checker.clone()))
            .collect();

        let results = join_all(
            checkers
                .into_iter()
                .map(|(name, checker)| self.run_checker(ctx, name, checker)),
        )
        .await;

        self.store(&results);
        results
            .into_iter()
            .map(|r| (r.component.clone(), r))
            .collect()
    }

    async fn run_checker(
        &self,
        ctx: &Context,
        name: String,
        checker: Arc<dyn HealthChecker>,
    ) -> HealthCheckResult {
        let timeout = *self.timeout.read();
        let check_ctx = ctx.with_timeout(timeout);
        let task_ctx = check_ctx.clone();
        let run = run_with_deadline(&check_ctx, async move { checker.health_check(&task_ctx).await }).await;

        let mut result = match run.outcome {
            Outcome::Completed(result) => result,
            Outcome::DeadlineExceeded => HealthCheckResult::unhealthy(
                &name,
                format!("health check timed out after {:?}", timeout),
            ),
            Outcome::Cancelled => HealthCheckResult::unhealthy(&name, "health check cancelled"),
            Outcome::Panicked(msg) => {
                HealthCheckResult::unhealthy(&name, format!("health check panicked: {}", msg))
            }
        };
        result.component = name;
        result.last_check = Some(SystemTime::now());
        result.response_time = run.elapsed;

        if result.status != HealthStatus::Healthy {
            tracing::warn!(
                component = %result.component,
                status = %result.status,
                message = %result.message,
                "Component unhealthy"
            );
        }
        metrics::record_health_check(&result);
        result
    }

    /// Results for checkers unregistered mid-check are dropped.
    fn store(&self, results: &[HealthCheckResult]) {
        let checkers = self.checkers.read();
        let mut stored = self.results.write();
        for result in results {
            if checkers.contains_key(&result.component) {
                stored.insert(result.component.clone(), result.clone());
            }
        }
    }

    /// Capture and store a process resource snapshot.
    pub fn perform_system_health_check(&self) -> SystemHealthSnapshot {
        let snapshot = system::capture(self.started);
        metrics::record_system_snapshot(&snapshot);
        *self.system.write() = Some(snapshot.clone());
        snapshot
    }

    pub fn health_summary(&self) -> HealthSummary {
        let component_results = self.results.read().clone();
        let total_components = component_results.len();
        let healthy_components = component_results
            .values()
            .filter(|r| r.status == HealthStatus::Healthy)
            .count();

        let mut unhealthy_components: Vec<String> = component_results
            .values()
            .filter(|r| r.status != HealthStatus::Healthy)
            .map(|r| r.component.clone())
            .collect();
        unhealthy_components.sort();

        let overall_status = if total_components == 0 {
            HealthStatus::Unknown
        } else if unhealthy_components.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthSummary {
            overall_status,
            total_components,
            healthy_components,
            unhealthy_components,
            last_check: component_results.values().filter_map(|r| r.last_check).max(),
            system_health: self.system.read().clone(),
            component_results,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_summary().overall_status == HealthStatus::Healthy
    }

    pub fn unhealthy_components(&self) -> Vec<String> {
        self.health_summary().unhealthy_components
    }

    pub fn component_result(&self, name: &str) -> Option<HealthCheckResult> {
        self.results.read().get(name).cloned()
    }

    pub fn system_health(&self) -> Option<SystemHealthSnapshot> {
        self.system.read().clone()
    }

    pub fn set_check_interval(&self, interval: Duration) {
        *self.check_interval.write() = interval;
    }

    pub fn check_interval(&self) -> Duration {
        *self.check_interval.read()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    /// Forget all results; registered checkers go back to unknown.
    pub fn clear_results(&self) {
        let checkers = self.checkers.read();
        let mut results = self.results.write();
        results.clear();
        for name in checkers.keys() {
            results.insert(name.clone(), HealthCheckResult::unknown(name));
        }
        *self.system.write() = None;
    }

    pub fn checker_count(&self) -> usize {
        self.checkers.read().len()
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}
