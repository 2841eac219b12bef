//! Startup orchestration.
//!
//! # Responsibilities
//! - Keep the registry of modules in dependency order
//! - Initialize and start modules in that order
//! - Stop modules in reverse order
//! - Aggregate per-module status and health
//!
//! # Design Decisions
//! - Fail fast on startup: the first failing module aborts the rest
//! - Fail open on shutdown: a failing module is logged and skipped, the loop
//!   always completes so a misbehaving module never blocks process exit
//! - One ordered list of (rank, module) records is the single source of truth
//!   for both start and stop order

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::lifecycle::context::Context;
use crate::lifecycle::module::{Module, ModuleError, ModuleState, ModuleStatus};
use crate::resilience::timeouts::{run_with_deadline, Outcome};

/// Deadline applied to each module's `stop` call.
pub const MODULE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while registering, starting or checking modules.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("module '{module}' initialization failed: {source}")]
    Initialize {
        module: String,
        #[source]
        source: ModuleError,
    },

    #[error("module '{module}' start failed: {source}")]
    Start {
        module: String,
        #[source]
        source: ModuleError,
    },

    #[error("module '{module}' health check failed: {source}")]
    HealthCheck {
        module: String,
        #[source]
        source: ModuleError,
    },
}

impl StartupError {
    /// Name of the module the error is attributed to.
    pub fn module(&self) -> &str {
        match self {
            StartupError::DuplicateModule(m) => m,
            StartupError::Initialize { module, .. }
            | StartupError::Start { module, .. }
            | StartupError::HealthCheck { module, .. } => module,
        }
    }
}

/// Counts and name lists describing the module registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupMetrics {
    pub total_modules: usize,
    pub running_modules: Vec<String>,
    pub stopped_modules: Vec<String>,
    pub error_modules: Vec<String>,
}

struct ModuleEntry {
    rank: u32,
    module: Arc<dyn Module>,
    status: ModuleStatus,
}

/// Drives module startup and shutdown in rank order.
#[derive(Default)]
pub struct Starter {
    registry: RwLock<Vec<ModuleEntry>>,
}

impl Starter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module so it starts after every module registered so far.
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<(), StartupError> {
        let rank = {
            let registry = self.registry.read();
            registry.last().map_or(0, |e| e.rank.saturating_add(1))
        };
        self.register_module_with_rank(module, rank)
    }

    /// Register a module with an explicit dependency rank. Lower ranks start
    /// first and stop last; equal ranks keep registration order.
    pub fn register_module_with_rank(
        &self,
        module: Arc<dyn Module>,
        rank: u32,
    ) -> Result<(), StartupError> {
        let name = module.name().to_string();
        let mut registry = self.registry.write();

        if registry.iter().any(|e| e.status.name == name) {
            return Err(StartupError::DuplicateModule(name));
        }

        let pos = registry.partition_point(|e| e.rank <= rank);
        registry.insert(
            pos,
            ModuleEntry {
                rank,
                module,
                status: ModuleStatus::registered(&name),
            },
        );

        tracing::debug!(module = %name, rank, "Module registered");
        Ok(())
    }

    /// Initialize and start every module in start order, aborting at the
    /// first failure.
    pub async fn start_modules(&self, ctx: &Context) -> Result<(), StartupError> {
        let modules = self.ordered_modules();
        tracing::info!(count = modules.len(), "Starting modules");

        for module in modules {
            self.initialize_module(ctx, module).await?;
        }

        tracing::info!("All modules started");
        Ok(())
    }

    async fn initialize_module(
        &self,
        ctx: &Context,
        module: Arc<dyn Module>,
    ) -> Result<(), StartupError> {
        let name = module.name().to_string();
        self.update_status(&name, |s| {
            s.state = ModuleState::Initializing;
            s.start_time = Some(SystemTime::now());
            s.error = None;
        });

        let span = tracing::info_span!("module", module = %name);
        if let Err(e) = module.initialize(ctx, span).await {
            tracing::error!(module = %name, error = %e, "Module initialization failed");
            self.mark_error(&name, e.to_string());
            return Err(StartupError::Initialize {
                module: name,
                source: e,
            });
        }

        if let Err(e) = module.start(ctx).await {
            tracing::error!(module = %name, error = %e, "Module start failed");
            self.mark_error(&name, e.to_string());
            return Err(StartupError::Start {
                module: name,
                source: e,
            });
        }

        self.update_status(&name, |s| s.state = ModuleState::Running);
        tracing::info!(module = %name, "Module started");
        Ok(())
    }

    /// Stop every module touched by startup, in reverse start order.
    ///
    /// Each module gets its own deadline of [`MODULE_STOP_TIMEOUT`] (capped by
    /// `ctx`). Failures are logged and recorded in the module's status; they
    /// never abort the loop.
    pub async fn stop_modules(&self, ctx: &Context) {
        let modules: Vec<Arc<dyn Module>> = {
            let registry = self.registry.read();
            registry
                .iter()
                .rev()
                .filter(|e| {
                    !matches!(
                        e.status.state,
                        ModuleState::Registered | ModuleState::Stopped
                    )
                })
                .map(|e| e.module.clone())
                .collect()
        };

        tracing::info!(count = modules.len(), "Stopping modules");

        for module in modules {
            let name = module.name().to_string();
            self.update_status(&name, |s| s.state = ModuleState::Stopping);

            let stop_ctx = ctx.with_timeout(MODULE_STOP_TIMEOUT);
            let task_ctx = stop_ctx.clone();
            let target = module.clone();
            let result =
                run_with_deadline(&stop_ctx, async move { target.stop(&task_ctx).await }).await;

            let failure = match result.outcome {
                Outcome::Completed(Ok(())) => None,
                Outcome::Completed(Err(e)) => Some(e.to_string()),
                Outcome::DeadlineExceeded => {
                    Some(format!("stop timed out after {:?}", result.elapsed))
                }
                Outcome::Cancelled => Some("stop cancelled".to_string()),
                Outcome::Panicked(msg) => Some(format!("stop panicked: {}", msg)),
            };

            match failure {
                None => {
                    self.update_status(&name, |s| s.state = ModuleState::Stopped);
                    tracing::info!(module = %name, elapsed = ?result.elapsed, "Module stopped");
                }
                Some(reason) => {
                    tracing::error!(module = %name, error = %reason, "Module stop failed, continuing");
                    self.mark_error(&name, reason);
                }
            }
        }
    }

    /// Health-check every running module in start order, failing on the
    /// first unhealthy one.
    pub async fn perform_health_check(&self, ctx: &Context) -> Result<(), StartupError> {
        let running: Vec<Arc<dyn Module>> = {
            let registry = self.registry.read();
            registry
                .iter()
                .filter(|e| e.status.state == ModuleState::Running)
                .map(|e| e.module.clone())
                .collect()
        };

        for module in running {
            let checked = tokio::select! {
                r = module.health_check(ctx) => r,
                _ = ctx.done() => Err(ModuleError::from("health check deadline exceeded")),
            };

            if let Err(e) = checked {
                return Err(StartupError::HealthCheck {
                    module: module.name().to_string(),
                    source: e,
                });
            }
        }

        Ok(())
    }

    /// Status of every registered module keyed by name.
    pub fn module_status(&self) -> HashMap<String, ModuleStatus> {
        self.registry
            .read()
            .iter()
            .map(|e| (e.status.name.clone(), e.status.clone()))
            .collect()
    }

    /// Names of modules currently in `state`, in start order.
    pub fn modules_with_state(&self, state: ModuleState) -> Vec<String> {
        self.registry
            .read()
            .iter()
            .filter(|e| e.status.state == state)
            .map(|e| e.status.name.clone())
            .collect()
    }

    /// Module names in start order.
    pub fn start_order(&self) -> Vec<String> {
        self.registry
            .read()
            .iter()
            .map(|e| e.status.name.clone())
            .collect()
    }

    pub fn module_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn startup_metrics(&self) -> StartupMetrics {
        StartupMetrics {
            total_modules: self.module_count(),
            running_modules: self.modules_with_state(ModuleState::Running),
            stopped_modules: self.modules_with_state(ModuleState::Stopped),
            error_modules: self.modules_with_state(ModuleState::Error),
        }
    }

    fn ordered_modules(&self) -> Vec<Arc<dyn Module>> {
        self.registry
            .read()
            .iter()
            .map(|e| e.module.clone())
            .collect()
    }

    fn update_status(&self, name: &str, f: impl FnOnce(&mut ModuleStatus)) {
        let mut registry = self.registry.write();
        if let Some(entry) = registry.iter_mut().find(|e| e.status.name == name) {
            f(&mut entry.status);
        }
    }

    fn mark_error(&self, name: &str, message: String) {
        self.update_status(name, |s| {
            s.state = ModuleState::Error;
            s.error = Some(message);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Clone, Copy, PartialEq)]
    enum FailAt {
        Nothing,
        Initialize,
        Start,
        Stop,
        Health,
    }

    struct FakeModule {
        name: String,
        fail_at: FailAt,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeModule {
        fn new(name: &str, fail_at: FailAt, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail_at,
                log: log.clone(),
            })
        }

        fn step(&self, what: &str, fail: FailAt) -> Result<(), ModuleError> {
            self.log.lock().push(format!("{}:{}", what, self.name));
            if self.fail_at == fail {
                Err(format!("{} broke", what).into())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Module for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }
        async fn initialize(&self, _ctx: &Context, _span: tracing::Span) -> Result<(), ModuleError> {
            self.step("init", FailAt::Initialize)
        }
        async fn start(&self, _ctx: &Context) -> Result<(), ModuleError> {
            self.step("start", FailAt::Start)
        }
        async fn stop(&self, _ctx: &Context) -> Result<(), ModuleError> {
            self.step("stop", FailAt::Stop)
        }
        async fn health_check(&self, _ctx: &Context) -> Result<(), ModuleError> {
            self.step("health", FailAt::Health)
        }
    }

    #[tokio::test]
    async fn test_start_order_follows_rank_then_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let starter = Starter::new();
        starter
            .register_module_with_rank(FakeModule::new("collector", FailAt::Nothing, &log), 3)
            .unwrap();
        starter
            .register_module_with_rank(FakeModule::new("device", FailAt::Nothing, &log), 0)
            .unwrap();
        starter
            .register_module_with_rank(FakeModule::new("registry", FailAt::Nothing, &log), 3)
            .unwrap();

        assert_eq!(starter.start_order(), vec!["device", "collector", "registry"]);

        starter.start_modules(&Context::background()).await.unwrap();
        starter.stop_modules(&Context::background()).await;

        let log = log.lock().clone();
        assert_eq!(
            log,
            vec![
                "init:device", "start:device",
                "init:collector", "start:collector",
                "init:registry", "start:registry",
                "stop:registry", "stop:collector", "stop:device",
            ]
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let starter = Starter::new();
        starter
            .register_module(FakeModule::new("engine", FailAt::Nothing, &log))
            .unwrap();
        let err = starter
            .register_module(FakeModule::new("engine", FailAt::Nothing, &log))
            .unwrap_err();
        assert!(matches!(err, StartupError::DuplicateModule(ref n) if n == "engine"));
    }

    #[tokio::test]
    async fn test_start_fails_fast_and_names_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let starter = Starter::new();
        starter.register_module(FakeModule::new("a", FailAt::Nothing, &log)).unwrap();
        starter.register_module(FakeModule::new("b", FailAt::Start, &log)).unwrap();
        starter.register_module(FakeModule::new("c", FailAt::Nothing, &log)).unwrap();

        let err = starter.start_modules(&Context::background()).await.unwrap_err();
        assert!(matches!(err, StartupError::Start { .. }));
        assert_eq!(err.module(), "b");
        assert!(err.to_string().contains("start failed"));

        let status = starter.module_status();
        assert_eq!(status["a"].state, ModuleState::Running);
        assert_eq!(status["b"].state, ModuleState::Error);
        assert_eq!(status["c"].state, ModuleState::Registered);
        assert!(!log.lock().iter().any(|e| e.ends_with(":c")));
    }

    #[tokio::test]
    async fn test_initialize_failure_is_distinguished() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let starter = Starter::new();
        starter.register_module(FakeModule::new("a", FailAt::Initialize, &log)).unwrap();

        let err = starter.start_modules(&Context::background()).await.unwrap_err();
        assert!(matches!(err, StartupError::Initialize { .. }));
        assert!(err.to_string().contains("initialization failed"));
    }

    #[tokio::test]
    async fn test_stop_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let starter = Starter::new();
        starter.register_module(FakeModule::new("a", FailAt::Nothing, &log)).unwrap();
        starter.register_module(FakeModule::new("b", FailAt::Stop, &log)).unwrap();
        starter.register_module(FakeModule::new("c", FailAt::Nothing, &log)).unwrap();
        starter.start_modules(&Context::background()).await.unwrap();

        starter.stop_modules(&Context::background()).await;

        let metrics = starter.startup_metrics();
        assert_eq!(metrics.total_modules, 3);
        assert_eq!(metrics.stopped_modules, vec!["a", "c"]);
        assert_eq!(metrics.error_modules, vec!["b"]);
        assert!(log.lock().contains(&"stop:a".to_string()));
    }

    #[tokio::test]
    async fn test_health_check_fails_fast_on_running_modules() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let starter = Starter::new();
        starter.register_module(FakeModule::new("a", FailAt::Health, &log)).unwrap();
        starter.register_module(FakeModule::new("b", FailAt::Nothing, &log)).unwrap();
        starter.start_modules(&Context::background()).await.unwrap();

        let err = starter
            .perform_health_check(&Context::background())
            .await
            .unwrap_err();
        assert_eq!(err.module(), "a");
        assert!(!log.lock().contains(&"health:b".to_string()));
    }
}
