//! Top-level lifecycle state machine.
//!
//! # Responsibilities
//! - Own the starter, shutdown, signal and health managers
//! - Wire graceful signals to `stop` and the force signal to `force_shutdown`
//! - Register the shutdown pipeline and the periodic health monitor
//! - Track the lifecycle state and the last fatal error
//!
//! # Design Decisions
//! - `stop` always ends in `Stopped`, even when a shutdown step failed
//! - A failed `start` leaves modules and the health monitor as they are
//! - The fatal error channel holds one error; later errors are dropped
//!   (logged) until `wait_for_shutdown` consumes it
//! - Handlers and steps hold `Weak` references so the manager can be dropped

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::task::TaskTracker;

use crate::config::{LifecycleConfig, ServiceConfig};
use crate::health::{HealthManager, ModuleChecker};
use crate::lifecycle::context::Context;
use crate::lifecycle::module::Module;
use crate::lifecycle::shutdown::{
    ShutdownError, ShutdownManager, ShutdownPhase, ShutdownStep, StepError,
};
use crate::lifecycle::signals::{HandlerError, Signal, SignalError, SignalManager};
use crate::lifecycle::startup::{Starter, StartupError};
use crate::observability::metrics;

/// Pause between the stop and start halves of [`LifecycleManager::restart`].
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

const STATE_CHANNEL_CAPACITY: usize = 16;

type HookFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// State of the service as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 5] = [
        LifecycleState::Stopped,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Point-in-time view of the lifecycle manager.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub state: LifecycleState,
    /// Time since the last `start`, zero if never started.
    pub uptime: Duration,
    pub module_count: usize,
    pub running_modules: Vec<String>,
    pub stopped_modules: Vec<String>,
    pub error_modules: Vec<String>,
    pub last_error: Option<String>,
    pub shutdown_timeout: Duration,
}

struct Inner {
    config: LifecycleConfig,
    state: RwLock<LifecycleState>,
    state_tx: broadcast::Sender<LifecycleState>,
    starter: Starter,
    shutdown: ShutdownManager,
    signals: SignalManager,
    health: HealthManager,
    root: Mutex<Context>,
    tracker: TaskTracker,
    last_error: RwLock<Option<String>>,
    error_tx: mpsc::Sender<String>,
    error_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    start_time: RwLock<Option<Instant>>,
    hooks: RwLock<Vec<(String, HookFn)>>,
    stop_lock: tokio::sync::Mutex<()>,
}

/// Coordinates startup, signal handling, health monitoring and shutdown.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(config: &ServiceConfig) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);

        Self {
            inner: Arc::new(Inner {
                config: config.lifecycle.clone(),
                state: RwLock::new(LifecycleState::Stopped),
                state_tx,
                starter: Starter::new(),
                shutdown: ShutdownManager::new(config.shutdown.clone()),
                signals: SignalManager::new(config.signals.clone()),
                health: HealthManager::new(&config.health),
                root: Mutex::new(Context::background()),
                tracker: TaskTracker::new(),
                last_error: RwLock::new(None),
                error_tx,
                error_rx: tokio::sync::Mutex::new(error_rx),
                start_time: RwLock::new(None),
                hooks: RwLock::new(Vec::new()),
                stop_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Register a module with the starter and expose its health check to the
    /// health manager.
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<(), StartupError> {
        self.inner.starter.register_module(module.clone())?;
        self.inner
            .health
            .register_checker(Arc::new(ModuleChecker::new(module)));
        Ok(())
    }

    /// Like [`register_module`](Self::register_module) with an explicit
    /// dependency rank.
    pub fn register_module_with_rank(
        &self,
        module: Arc<dyn Module>,
        rank: u32,
    ) -> Result<(), StartupError> {
        self.inner
            .starter
            .register_module_with_rank(module.clone(), rank)?;
        self.inner
            .health
            .register_checker(Arc::new(ModuleChecker::new(module)));
        Ok(())
    }

    /// Add a hook run by the Post-phase `run-shutdown-hooks` step, in
    /// registration order.
    pub fn add_shutdown_hook<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        let hook: HookFn = Arc::new(move |ctx| Box::pin(hook(ctx)));
        self.inner.hooks.write().push((name.into(), hook));
    }

    /// Start the service.
    ///
    /// The root context is derived from `ctx`; cancelling `ctx` later has the
    /// same effect as a graceful shutdown request.
    pub async fn start(&self, ctx: &Context) -> Result<(), LifecycleError> {
        self.begin_start()?;
        tracing::info!("Starting service");

        // Leftovers from a run that ended in Error.
        self.inner.root.lock().cancel();
        self.inner.signals.stop_listening().await;
        self.drain_errors();
        *self.inner.last_error.write() = None;

        let root = ctx.with_cancel();
        *self.inner.root.lock() = root.clone();
        *self.inner.start_time.write() = Some(Instant::now());
        self.inner.tracker.reopen();

        self.setup_signal_handlers();
        self.setup_shutdown_steps();

        if let Err(e) = self.inner.starter.start_modules(&root).await {
            self.set_error(&e);
            return Err(e.into());
        }

        self.spawn_health_monitor(root);

        if let Err(e) = self.inner.signals.start_listening() {
            self.set_error(&e);
            return Err(e.into());
        }

        if let Err(e) = self.finish_start() {
            // The stop that interrupted us may have run before these modules
            // came up.
            tracing::warn!(error = %e, "Start interrupted, stopping started modules");
            self.inner.signals.stop_listening().await;
            let ctx = Context::background().with_timeout(self.inner.config.shutdown_timeout());
            self.inner.starter.stop_modules(&ctx).await;
            return Err(e);
        }
        tracing::info!(
            modules = self.inner.starter.module_count(),
            "Service running"
        );
        Ok(())
    }

    /// Wait for a reported fatal error or root cancellation, then stop under
    /// the configured shutdown timeout.
    pub async fn wait_for_shutdown(&self) -> Result<(), LifecycleError> {
        let root = self.inner.root.lock().clone();

        let fatal = {
            let mut errors = self.inner.error_rx.lock().await;
            tokio::select! {
                Some(message) = errors.recv() => {
                    tracing::error!(error = %message, "Fatal error reported, shutting down");
                    Some(message)
                }
                _ = root.done() => {
                    tracing::info!("Shutdown requested");
                    None
                }
            }
        };

        let ctx = Context::background().with_timeout(self.inner.config.shutdown_timeout());
        self.stop(&ctx).await?;

        match fatal {
            Some(message) => Err(LifecycleError::Fatal(message)),
            None => Ok(()),
        }
    }

    /// Gracefully stop the service.
    ///
    /// Calls are serialized; stopping an already stopped manager only makes
    /// sure signal listening has ended.
    pub async fn stop(&self, ctx: &Context) -> Result<(), LifecycleError> {
        let _serialized = self.inner.stop_lock.lock().await;

        if self.state() == LifecycleState::Stopped {
            self.inner.signals.stop_listening().await;
            return Ok(());
        }

        self.set_state(LifecycleState::Stopping);
        tracing::info!("Stopping service");

        self.inner.root.lock().cancel();
        self.inner.signals.stop_listening().await;

        let result = self.inner.shutdown.execute_shutdown(ctx).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Shutdown sequence failed");
        }

        self.inner.tracker.close();
        tokio::select! {
            _ = self.inner.tracker.wait() => {}
            _ = ctx.done() => {
                tracing::warn!(
                    outstanding = self.inner.tracker.len(),
                    "Timed out waiting for internal tasks"
                );
            }
        }

        self.set_state(LifecycleState::Stopped);
        tracing::info!("Service stopped");
        result.map_err(Into::into)
    }

    /// Cancel everything and mark the service stopped without running any
    /// shutdown step or hook.
    pub fn force_shutdown(&self) {
        tracing::warn!("Forcing shutdown, skipping shutdown steps");
        self.inner.root.lock().cancel();
        self.inner.shutdown.cancel();
        self.set_state(LifecycleState::Stopped);
    }

    /// Stop, pause for [`RESTART_DELAY`], then start. A failed start leaves the
    /// manager in `Error`.
    pub async fn restart(&self, ctx: &Context) -> Result<(), LifecycleError> {
        tracing::info!("Restarting service");
        self.stop(ctx).await?;
        tokio::time::sleep(RESTART_DELAY).await;
        self.start(ctx).await
    }

    /// Check every running module, then capture a system snapshot. Only
    /// valid while running.
    pub async fn perform_health_check(&self, ctx: &Context) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != LifecycleState::Running {
            return Err(LifecycleError::InvalidState {
                operation: "perform health check",
                state,
            });
        }

        self.inner.starter.perform_health_check(ctx).await?;
        self.inner.health.perform_system_health_check();
        Ok(())
    }

    /// Record a fatal error: the state becomes `Error` and
    /// `wait_for_shutdown` wakes up.
    pub fn report_error(&self, error: impl std::fmt::Display) {
        self.set_error(&error);
    }

    fn set_error(&self, error: &dyn std::fmt::Display) {
        let message = error.to_string();
        tracing::error!(error = %message, "Lifecycle error");

        *self.inner.last_error.write() = Some(message.clone());
        self.set_state(LifecycleState::Error);

        match self.inner.error_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(error = %dropped, "Error channel full, dropping error");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn drain_errors(&self) {
        if let Ok(mut errors) = self.inner.error_rx.try_lock() {
            while errors.try_recv().is_ok() {}
        }
    }

    /// Check and enter `Starting` under one lock acquisition.
    fn begin_start(&self) -> Result<(), LifecycleError> {
        let previous = {
            let mut state = self.inner.state.write();
            let current = *state;
            if !matches!(current, LifecycleState::Stopped | LifecycleState::Error) {
                return Err(LifecycleError::InvalidState {
                    operation: "start",
                    state: current,
                });
            }
            *state = LifecycleState::Starting;
            current
        };
        self.announce(previous, LifecycleState::Starting);
        Ok(())
    }

    /// Enter `Running` only if the state is still `Starting`.
    fn finish_start(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.inner.state.write();
            if *state != LifecycleState::Starting {
                return Err(LifecycleError::InvalidState {
                    operation: "finish start",
                    state: *state,
                });
            }
            *state = LifecycleState::Running;
        }
        self.announce(LifecycleState::Starting, LifecycleState::Running);
        Ok(())
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut *state, next)
        };
        self.announce(previous, next);
    }

    fn announce(&self, previous: LifecycleState, next: LifecycleState) {
        if previous == next {
            return;
        }

        tracing::info!(from = %previous, to = %next, "Lifecycle state changed");
        metrics::record_lifecycle_state(next);
        // No subscribers is fine.
        let _ = self.inner.state_tx.send(next);
    }

    fn setup_signal_handlers(&self) {
        let signals = &self.inner.signals;
        let config = signals.config();

        if config.enable_graceful {
            let weak = Arc::downgrade(&self.inner);
            signals.register_multiple_handlers(
                &[Signal::Terminate, Signal::Interrupt],
                move |_ctx, signal| {
                    let weak = weak.clone();
                    async move {
                        if let Some(manager) = Self::upgrade(&weak) {
                            tracing::info!(signal = %signal, "Graceful shutdown requested");
                            // Stopping joins the dispatch task running this handler.
                            tokio::spawn(async move {
                                let ctx = Context::background()
                                    .with_timeout(manager.inner.config.shutdown_timeout());
                                if let Err(e) = manager.stop(&ctx).await {
                                    tracing::error!(error = %e, "Signal-triggered stop failed");
                                }
                            });
                        }
                        Ok::<(), HandlerError>(())
                    }
                },
            );
        }

        if config.enable_force {
            let weak = Arc::downgrade(&self.inner);
            signals.register_handler(Signal::Quit, move |_ctx, signal| {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = Self::upgrade(&weak) {
                        tracing::warn!(signal = %signal, "Force shutdown requested");
                        tokio::spawn(async move { manager.force_shutdown() });
                    }
                    Ok::<(), HandlerError>(())
                }
            });
        }
    }

    fn setup_shutdown_steps(&self) {
        let shutdown = &self.inner.shutdown;
        let main_timeout = shutdown.config().phase_timeout(ShutdownPhase::Main);
        shutdown.clear_steps();

        let weak = Arc::downgrade(&self.inner);
        let stop_modules = {
            let weak = weak.clone();
            move |ctx: Context| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.starter.stop_modules(&ctx).await;
                    }
                    Ok::<(), StepError>(())
                }
            }
        };
        let hooks_step = {
            let weak = weak.clone();
            move |ctx: Context| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => run_hooks(&inner, &ctx).await,
                        None => Ok(()),
                    }
                }
            }
        };
        let cleanup = move |_ctx: Context| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.health.clear_results();
                    let uptime = inner.start_time.read().map(|t| t.elapsed());
                    tracing::info!(uptime = ?uptime, "Shutdown cleanup complete");
                }
                Ok::<(), StepError>(())
            }
        };

        shutdown.add_shutdown_steps([
            ShutdownStep::new("stop-accepting-work", ShutdownPhase::Pre, |_ctx| async {
                tracing::debug!("No longer accepting new work");
                Ok::<(), StepError>(())
            }),
            ShutdownStep::new("stop-modules", ShutdownPhase::Main, stop_modules)
                .required(true)
                .with_timeout(main_timeout),
            ShutdownStep::new("run-shutdown-hooks", ShutdownPhase::Post, hooks_step),
            ShutdownStep::new("cleanup", ShutdownPhase::Post, cleanup).with_priority(10),
        ]);
    }

    fn spawn_health_monitor(&self, root: Context) {
        let interval = self.inner.health.check_interval();
        if interval.is_zero() {
            tracing::info!("Health monitor disabled");
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.tracker.spawn(async move {
            tracing::info!(interval = ?interval, "Health monitor starting");
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = root.done() => {
                        tracing::debug!("Health monitor exiting");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = Self::upgrade(&weak) else { break };
                        // A module that never answers must not stall the loop.
                        let tick_ctx = root.with_timeout(manager.inner.health.timeout());
                        if let Err(e) = manager.perform_health_check(&tick_ctx).await {
                            tracing::warn!(error = %e, "Periodic health check failed");
                        }
                        manager.inner.health.perform_all_health_checks(&root).await;
                    }
                }
            }
        });
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.read()
    }

    /// Receive every subsequent state transition.
    pub fn subscribe_state(&self) -> broadcast::Receiver<LifecycleState> {
        self.inner.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    pub fn metrics(&self) -> LifecycleMetrics {
        let startup = self.inner.starter.startup_metrics();
        LifecycleMetrics {
            state: self.state(),
            uptime: self
                .inner
                .start_time
                .read()
                .map(|t| t.elapsed())
                .unwrap_or_default(),
            module_count: startup.total_modules,
            running_modules: startup.running_modules,
            stopped_modules: startup.stopped_modules,
            error_modules: startup.error_modules,
            last_error: self.last_error(),
            shutdown_timeout: self.inner.config.shutdown_timeout(),
        }
    }

    /// The current root context. Replaced on every `start`.
    pub fn root_context(&self) -> Context {
        self.inner.root.lock().clone()
    }

    pub fn starter(&self) -> &Starter {
        &self.inner.starter
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.inner.shutdown
    }

    pub fn signal_manager(&self) -> &SignalManager {
        &self.inner.signals
    }

    pub fn health_manager(&self) -> &HealthManager {
        &self.inner.health
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(&ServiceConfig::default())
    }
}

async fn run_hooks(inner: &Inner, ctx: &Context) -> Result<(), StepError> {
    let hooks: Vec<(String, HookFn)> = inner.hooks.read().clone();
    let mut failures = Vec::new();

    for (name, hook) in hooks {
        match hook(ctx.clone()).await {
            Ok(()) => tracing::debug!(hook = %name, "Shutdown hook completed"),
            Err(e) => {
                tracing::warn!(hook = %name, error = %e, "Shutdown hook failed");
                failures.push(format!("{}: {}", name, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; ").into())
    }
}
