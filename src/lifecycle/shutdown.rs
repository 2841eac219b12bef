//! Phased shutdown coordination.
//!
//! # Data Flow
//! ```text
//! execute_shutdown(ctx)
//!     → guard: one execution at a time
//!     → Pre → Main → Post, each under its own phase deadline
//!         → steps sorted by priority (stable)
//!         → sequential: required failure aborts everything
//!         → concurrent: all steps finish, then required failures aggregate
//!     → optional grace wait for steps that outlived their deadline
//! ```
//!
//! # Design Decisions
//! - Steps run as tracked tasks; a deadline marks the result as timed out but
//!   never aborts the task (cancellation is cooperative)
//! - Results are append-only and kept until `clear_steps`

use futures_util::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::task::TaskTracker;

use crate::config::ShutdownConfig;
use crate::lifecycle::context::Context;
use crate::observability::metrics;
use crate::resilience::timeouts::{run_tracked_with_deadline, Outcome};

/// Error type returned by shutdown step functions.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

type StepFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// Shutdown phases, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPhase {
    Pre,
    Main,
    Post,
}

impl ShutdownPhase {
    pub const ALL: [ShutdownPhase; 3] = [ShutdownPhase::Pre, ShutdownPhase::Main, ShutdownPhase::Post];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownPhase::Pre => "pre",
            ShutdownPhase::Main => "main",
            ShutdownPhase::Post => "post",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named unit of shutdown work.
#[derive(Clone)]
pub struct ShutdownStep {
    pub name: String,
    pub phase: ShutdownPhase,
    /// Overrides the manager's default timeout.
    pub timeout: Option<Duration>,
    /// A failed required step fails the shutdown.
    pub required: bool,
    /// Lower runs earlier in sequential mode.
    pub priority: i32,
    execute: StepFn,
}

impl ShutdownStep {
    /// Create a non-required step with priority 0 and the default timeout.
    ///
    /// `f` receives the step's context; it should return promptly once
    /// `ctx.done()` resolves, otherwise it keeps running after its deadline.
    pub fn new<F, Fut>(name: impl Into<String>, phase: ShutdownPhase, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            phase,
            timeout: None,
            required: false,
            priority: 0,
            execute: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for ShutdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownStep")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("timeout", &self.timeout)
            .field("required", &self.required)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Outcome of one step execution.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownResult {
    pub step: String,
    pub phase: ShutdownPhase,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub timeout_hit: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl ShutdownResult {
    fn skipped(step: &ShutdownStep, reason: &str) -> Self {
        Self {
            step: step.name.clone(),
            phase: step.phase,
            success: false,
            error: None,
            duration: Duration::ZERO,
            timeout_hit: false,
            skipped: true,
            skip_reason: Some(reason.to_string()),
        }
    }

    fn failed(&self) -> bool {
        !self.success && !self.skipped
    }
}

/// Errors returned by [`ShutdownManager::execute_shutdown`].
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown already in progress")]
    AlreadyInProgress,

    #[error("required shutdown step '{step}' failed in {phase} phase: {reason}")]
    RequiredStepFailed {
        step: String,
        phase: ShutdownPhase,
        reason: String,
    },

    #[error(
        "{count} required shutdown step(s) failed in {phase} phase: {list}",
        count = .failures.len(),
        list = .failures.join("; ")
    )]
    RequiredStepsFailed {
        phase: ShutdownPhase,
        failures: Vec<String>,
    },
}

/// Runs registered shutdown steps phase by phase.
pub struct ShutdownManager {
    config: RwLock<ShutdownConfig>,
    steps: RwLock<Vec<ShutdownStep>>,
    results: RwLock<Vec<ShutdownResult>>,
    in_progress: Mutex<bool>,
    current: Mutex<Option<Context>>,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
    tracker: TaskTracker,
}

impl ShutdownManager {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config: RwLock::new(config),
            steps: RwLock::new(Vec::new()),
            results: RwLock::new(Vec::new()),
            in_progress: Mutex::new(false),
            current: Mutex::new(None),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn add_shutdown_step(&self, step: ShutdownStep) {
        tracing::debug!(step = %step.name, phase = %step.phase, priority = step.priority, "Shutdown step added");
        self.steps.write().push(step);
    }

    pub fn add_shutdown_steps(&self, steps: impl IntoIterator<Item = ShutdownStep>) {
        for step in steps {
            self.add_shutdown_step(step);
        }
    }

    /// Execute all phases in order.
    ///
    /// Returns [`ShutdownError::AlreadyInProgress`] without running anything
    /// when another execution is in flight.
    pub async fn execute_shutdown(&self, ctx: &Context) -> Result<(), ShutdownError> {
        {
            let mut in_progress = self.in_progress.lock();
            if *in_progress {
                return Err(ShutdownError::AlreadyInProgress);
            }
            *in_progress = true;
        }
        let _guard = InProgressGuard(&self.in_progress);

        let exec_ctx = ctx.with_cancel();
        *self.current.lock() = Some(exec_ctx.clone());
        *self.started_at.lock() = Some(Instant::now());
        *self.finished_at.lock() = None;

        let config = self.config.read().clone();
        tracing::info!(
            steps = self.step_count(),
            parallel = config.parallel_execution,
            "Executing shutdown"
        );

        let result = self.run_phases(&exec_ctx, &config).await;

        if result.is_ok() && !config.force_kill_after().is_zero() {
            self.wait_for_stragglers(config.force_kill_after()).await;
        }

        *self.finished_at.lock() = Some(Instant::now());
        *self.current.lock() = None;

        match &result {
            Ok(()) => tracing::info!(duration = ?self.duration(), "Shutdown sequence completed"),
            Err(e) => tracing::error!(error = %e, duration = ?self.duration(), "Shutdown sequence failed"),
        }
        result
    }

    async fn run_phases(&self, ctx: &Context, config: &ShutdownConfig) -> Result<(), ShutdownError> {
        for phase in ShutdownPhase::ALL {
            let mut steps: Vec<ShutdownStep> = self
                .steps
                .read()
                .iter()
                .filter(|s| s.phase == phase)
                .cloned()
                .collect();

            if steps.is_empty() {
                tracing::debug!(phase = %phase, "No steps in shutdown phase");
                continue;
            }

            // sort_by_key is stable: equal priorities keep registration order.
            steps.sort_by_key(|s| s.priority);

            let phase_timeout = config.phase_timeout(phase);
            let phase_ctx = ctx.with_timeout(phase_timeout);
            tracing::info!(
                phase = %phase,
                steps = steps.len(),
                timeout = ?phase_timeout,
                "Entering shutdown phase"
            );

            if config.parallel_execution {
                self.run_concurrent(phase, &steps, &phase_ctx, config).await?;
            } else {
                self.run_sequential(phase, &steps, &phase_ctx, config).await?;
            }
        }
        Ok(())
    }

    async fn run_sequential(
        &self,
        phase: ShutdownPhase,
        steps: &[ShutdownStep],
        ctx: &Context,
        config: &ShutdownConfig,
    ) -> Result<(), ShutdownError> {
        for step in steps {
            let result = self.run_step(step, ctx, config).await;
            let failure = result.failed().then(|| result.error.clone().unwrap_or_default());
            self.results.write().push(result);

            if let Some(reason) = failure {
                if step.required {
                    tracing::error!(step = %step.name, phase = %phase, error = %reason, "Required shutdown step failed, aborting");
                    return Err(ShutdownError::RequiredStepFailed {
                        step: step.name.clone(),
                        phase,
                        reason,
                    });
                }
                tracing::warn!(step = %step.name, phase = %phase, error = %reason, "Shutdown step failed, continuing");
            }
        }
        Ok(())
    }

    async fn run_concurrent(
        &self,
        phase: ShutdownPhase,
        steps: &[ShutdownStep],
        ctx: &Context,
        config: &ShutdownConfig,
    ) -> Result<(), ShutdownError> {
        let results = join_all(steps.iter().map(|s| self.run_step(s, ctx, config))).await;

        let failures: Vec<String> = steps
            .iter()
            .zip(&results)
            .filter(|(step, result)| step.required && result.failed())
            .map(|(step, result)| {
                format!("{}: {}", step.name, result.error.as_deref().unwrap_or("unknown error"))
            })
            .collect();

        self.results.write().extend(results);

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::error!(phase = %phase, failed = failures.len(), "Required shutdown steps failed");
            Err(ShutdownError::RequiredStepsFailed { phase, failures })
        }
    }

    async fn run_step(&self, step: &ShutdownStep, phase_ctx: &Context, config: &ShutdownConfig) -> ShutdownResult {
        let skip_reason = if !config.enable_graceful && !step.required {
            Some("graceful shutdown disabled")
        } else if phase_ctx.is_done() {
            let reason = if phase_ctx.deadline_exceeded() {
                "phase deadline exceeded"
            } else {
                "shutdown cancelled"
            };
            if step.required {
                // A required step that never ran is a failure, not a skip.
                tracing::error!(step = %step.name, phase = %step.phase, reason, "Required shutdown step could not run");
                let result = ShutdownResult {
                    step: step.name.clone(),
                    phase: step.phase,
                    success: false,
                    error: Some(format!("not run: {}", reason)),
                    duration: Duration::ZERO,
                    timeout_hit: phase_ctx.deadline_exceeded(),
                    skipped: false,
                    skip_reason: None,
                };
                metrics::record_shutdown_step(&result);
                return result;
            }
            Some(reason)
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            tracing::warn!(step = %step.name, phase = %step.phase, reason, "Skipping shutdown step");
            let result = ShutdownResult::skipped(step, reason);
            metrics::record_shutdown_step(&result);
            return result;
        }

        let timeout = step.timeout.unwrap_or_else(|| config.default_timeout());
        let step_ctx = phase_ctx.with_timeout(timeout);

        if config.log_steps {
            tracing::info!(step = %step.name, phase = %step.phase, timeout = ?timeout, "Running shutdown step");
        } else {
            tracing::debug!(step = %step.name, phase = %step.phase, timeout = ?timeout, "Running shutdown step");
        }

        let execute = step.execute.clone();
        let task_ctx = step_ctx.clone();
        let run = run_tracked_with_deadline(&self.tracker, &step_ctx, async move { execute(task_ctx).await }).await;

        let (error, timeout_hit) = match run.outcome {
            Outcome::Completed(Ok(())) => (None, false),
            Outcome::Completed(Err(e)) => (Some(e.to_string()), false),
            Outcome::DeadlineExceeded if phase_ctx.deadline_exceeded() => (
                Some(format!("phase deadline exceeded after {:?}", run.elapsed)),
                true,
            ),
            Outcome::DeadlineExceeded => (Some(format!("timed out after {:?}", timeout)), true),
            Outcome::Cancelled => (Some("cancelled".to_string()), false),
            Outcome::Panicked(msg) => (Some(format!("panicked: {}", msg)), false),
        };

        let result = ShutdownResult {
            step: step.name.clone(),
            phase: step.phase,
            success: error.is_none(),
            error,
            duration: run.elapsed,
            timeout_hit,
            skipped: false,
            skip_reason: None,
        };

        metrics::record_shutdown_step(&result);

        if config.log_steps {
            tracing::info!(
                step = %result.step,
                success = result.success,
                timeout_hit = result.timeout_hit,
                duration = ?result.duration,
                "Shutdown step finished"
            );
        }
        result
    }

    async fn wait_for_stragglers(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                outstanding = self.tracker.len(),
                grace = ?grace,
                "Shutdown steps still running after grace period"
            );
        }
        self.tracker.reopen();
    }

    /// Results of every step executed since the last `clear_steps`.
    pub fn results(&self) -> Vec<ShutdownResult> {
        self.results.read().clone()
    }

    pub fn step_count(&self) -> usize {
        self.steps.read().len()
    }

    /// Remove all steps and results.
    pub fn clear_steps(&self) {
        self.steps.write().clear();
        self.results.write().clear();
    }

    /// Cancel the in-flight execution, if any. Steps not yet started are
    /// skipped; running steps see their context cancelled.
    pub fn cancel(&self) {
        if let Some(ctx) = self.current.lock().as_ref() {
            tracing::warn!("Cancelling shutdown execution");
            ctx.cancel();
        }
    }

    /// Duration of the last execution, or elapsed time of the current one.
    pub fn duration(&self) -> Option<Duration> {
        let started = (*self.started_at.lock())?;
        Some(match *self.finished_at.lock() {
            Some(finished) => finished.duration_since(started),
            None => started.elapsed(),
        })
    }

    pub fn is_in_progress(&self) -> bool {
        *self.in_progress.lock()
    }

    pub fn config(&self) -> ShutdownConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: ShutdownConfig) {
        *self.config.write() = config;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(ShutdownConfig::default())
    }
}

struct InProgressGuard<'a>(&'a Mutex<bool>);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}
