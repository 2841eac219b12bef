//! Heartbeat module.
//!
//! # Responsibilities
//! - Tick on a fixed interval and count beats
//! - Report unhealthy when no beat was seen for `stall_ticks` intervals
//!
//! # Design Decisions
//! - The ticking task runs inside the span handed to `initialize`
//! - The task exits on `stop` or when the start context is cancelled

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::HeartbeatConfig;
use crate::lifecycle::context::Context;
use crate::lifecycle::module::{Module, ModuleError};

pub const HEARTBEAT_MODULE_NAME: &str = "heartbeat";

struct Ticker {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct State {
    beats: AtomicU64,
    last_beat: Mutex<Option<Instant>>,
}

/// Liveness module: proves the runtime is still scheduling work.
pub struct HeartbeatModule {
    interval: Duration,
    stall_ticks: u32,
    state: Arc<State>,
    span: Mutex<Option<tracing::Span>>,
    ticker: Mutex<Option<Ticker>>,
}

impl HeartbeatModule {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            interval: config.interval(),
            stall_ticks: config.stall_ticks.max(1),
            state: Arc::new(State {
                beats: AtomicU64::new(0),
                last_beat: Mutex::new(None),
            }),
            span: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    /// Beats counted since the last `initialize`.
    pub fn beats(&self) -> u64 {
        self.state.beats.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.ticker.lock().is_some()
    }

    fn stall_after(&self) -> Duration {
        self.interval * self.stall_ticks
    }
}

#[async_trait]
impl Module for HeartbeatModule {
    fn name(&self) -> &str {
        HEARTBEAT_MODULE_NAME
    }

    async fn initialize(&self, _ctx: &Context, span: tracing::Span) -> Result<(), ModuleError> {
        if self.interval.is_zero() {
            return Err("heartbeat interval must be greater than zero".into());
        }
        self.state.beats.store(0, Ordering::Relaxed);
        *self.state.last_beat.lock() = None;
        *self.span.lock() = Some(span);
        Ok(())
    }

    async fn start(&self, ctx: &Context) -> Result<(), ModuleError> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Err("heartbeat already running".into());
        }

        let stop = CancellationToken::new();
        let span = self.span.lock().clone().unwrap_or_else(tracing::Span::current);
        let task = tokio::spawn(
            beat_loop(self.state.clone(), self.interval, ctx.clone(), stop.clone()).instrument(span),
        );

        *self.state.last_beat.lock() = Some(Instant::now());
        *ticker = Some(Ticker { stop, task });
        tracing::info!(interval = ?self.interval, "Heartbeat started");
        Ok(())
    }

    async fn stop(&self, ctx: &Context) -> Result<(), ModuleError> {
        let ticker = self.ticker.lock().take();
        let Some(Ticker { stop, task }) = ticker else {
            return Ok(());
        };

        stop.cancel();
        tokio::select! {
            joined = task => joined.map_err(|e| format!("heartbeat task failed: {}", e))?,
            _ = ctx.done() => return Err("heartbeat task did not exit before deadline".into()),
        }

        tracing::info!(beats = self.beats(), "Heartbeat stopped");
        Ok(())
    }

    async fn health_check(&self, _ctx: &Context) -> Result<(), ModuleError> {
        if !self.is_running() {
            return Err("heartbeat not running".into());
        }

        let last_beat = *self.state.last_beat.lock();
        match last_beat {
            Some(at) if at.elapsed() > self.stall_after() => {
                Err(format!("heartbeat stalled, last beat {:?} ago", at.elapsed()).into())
            }
            Some(_) => Ok(()),
            None => Err("heartbeat has not started".into()),
        }
    }
}

async fn beat_loop(state: Arc<State>, interval: Duration, ctx: Context, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ctx.done() => break,
            _ = ticker.tick() => {
                let beats = state.beats.fetch_add(1, Ordering::Relaxed) + 1;
                *state.last_beat.lock() = Some(Instant::now());
                tracing::trace!(beats, "Heartbeat");
            }
        }
    }
}
