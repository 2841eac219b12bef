//! Shared utilities for integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use service_lifecycle::lifecycle::{Context, Module, ModuleError};
use service_lifecycle::ServiceConfig;

/// Ordered record of module calls, e.g. `["init:db", "start:db", "stop:db"]`.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Events with the given prefix, prefix stripped.
    #[allow(dead_code)]
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Stage {
    Initialize,
    Start,
    Stop,
}

/// A module that records every call and can be told to fail.
pub struct MockModule {
    name: String,
    events: EventLog,
    fail_at: Option<Stage>,
    stop_delay: Duration,
    healthy: AtomicBool,
    health_hangs: AtomicBool,
}

#[allow(dead_code)]
impl MockModule {
    pub fn new(name: &str, events: &EventLog) -> Arc<Self> {
        Self::build(name, events, None, Duration::ZERO)
    }

    pub fn failing(name: &str, events: &EventLog, stage: Stage) -> Arc<Self> {
        Self::build(name, events, Some(stage), Duration::ZERO)
    }

    pub fn slow_stop(name: &str, events: &EventLog, delay: Duration) -> Arc<Self> {
        Self::build(name, events, None, delay)
    }

    fn build(name: &str, events: &EventLog, fail_at: Option<Stage>, stop_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: events.clone(),
            fail_at,
            stop_delay,
            healthy: AtomicBool::new(true),
            health_hangs: AtomicBool::new(false),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make `health_check` never return.
    pub fn set_health_hangs(&self, hangs: bool) {
        self.health_hangs.store(hangs, Ordering::SeqCst);
    }

    fn record(&self, stage: &str, which: Stage) -> Result<(), ModuleError> {
        self.events.push(format!("{}:{}", stage, self.name));
        if self.fail_at == Some(which) {
            return Err(format!("{} {} failed", self.name, stage).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Module for MockModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _ctx: &Context, _span: tracing::Span) -> Result<(), ModuleError> {
        self.record("init", Stage::Initialize)
    }

    async fn start(&self, _ctx: &Context) -> Result<(), ModuleError> {
        self.record("start", Stage::Start)
    }

    async fn stop(&self, ctx: &Context) -> Result<(), ModuleError> {
        if !self.stop_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.stop_delay) => {}
                _ = ctx.done() => {}
            }
        }
        self.record("stop", Stage::Stop)
    }

    async fn health_check(&self, _ctx: &Context) -> Result<(), ModuleError> {
        if self.health_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(format!("{} unhealthy", self.name).into())
        }
    }
}

/// Defaults with OS signal handling switched off.
#[allow(dead_code)]
pub fn quiet_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.signals.enable_graceful = false;
    config.signals.enable_force = false;
    config.signals.enable_reload = false;
    config
}
