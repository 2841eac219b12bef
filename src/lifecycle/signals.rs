//! OS signal handling.
//!
//! # Responsibilities
//! - Subscribe to the configured subset of SIGTERM, SIGINT, SIGQUIT, SIGHUP
//! - Classify each signal into a behavioral category
//! - Dispatch to the registered handler under a category deadline
//! - Keep a bounded history and per-signal counters
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - One long-lived dispatch task; handlers run as their own tasks so a
//!   handler that ignores its deadline cannot wedge the dispatcher's record
//!   keeping (it still runs to completion in the background)
//! - No default action: a signal without a handler is only recorded
//! - Tokio never uninstalls an OS handler once registered, so after
//!   `stop_listening` the process keeps ignoring the watched signals

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::future::{select_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SignalConfig;
use crate::lifecycle::context::Context;
use crate::observability::metrics;
use crate::resilience::timeouts::{run_with_deadline, Outcome};

/// Handler deadline for reload signals.
pub const RELOAD_SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler deadline for unclassified signals.
pub const UNKNOWN_SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type returned by signal handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type HandlerFn = Arc<dyn Fn(Context, Signal) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// An OS signal delivered to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
    /// SIGQUIT
    Quit,
    /// SIGHUP
    Hangup,
    /// Any other signal, by number.
    Other(i32),
}

impl Signal {
    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Signal::Terminate => SignalKind::terminate(),
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
            Signal::Other(n) => SignalKind::from_raw(*n),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Terminate => f.write_str("SIGTERM"),
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Quit => f.write_str("SIGQUIT"),
            Signal::Hangup => f.write_str("SIGHUP"),
            Signal::Other(n) => write!(f, "signal {}", n),
        }
    }
}

impl Serialize for Signal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Behavioral category of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Graceful,
    Force,
    Reload,
    Unknown,
}

/// Fixed classification table.
pub fn classify_signal(signal: Signal) -> SignalType {
    match signal {
        Signal::Terminate | Signal::Interrupt => SignalType::Graceful,
        Signal::Quit => SignalType::Force,
        Signal::Hangup => SignalType::Reload,
        Signal::Other(_) => SignalType::Unknown,
    }
}

/// Record of one received signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalInfo {
    pub signal: Signal,
    pub signal_type: SignalType,
    pub timestamp: SystemTime,
    pub process_id: u32,
    /// A handler ran and returned successfully.
    pub handled: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub timeout_hit: bool,
}

/// Errors raised by the signal manager itself (handler failures are only
/// recorded, never returned).
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("already listening for signals")]
    AlreadyListening,

    #[error("cannot update config while listening")]
    ConfigWhileListening,

    #[error("failed to subscribe to {signal}: {source}")]
    Subscribe {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(unix)]
type SignalStream = tokio::signal::unix::Signal;

#[cfg(not(unix))]
struct SignalStream;

#[cfg(not(unix))]
impl SignalStream {
    async fn recv(&mut self) -> Option<()> {
        tokio::signal::ctrl_c().await.ok()
    }
}

struct Listener {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: ArcSwap<SignalConfig>,
    handlers: RwLock<HashMap<Signal, HandlerFn>>,
    buffer: Mutex<VecDeque<SignalInfo>>,
    stats: DashMap<Signal, u64>,
    listener: Mutex<Option<Listener>>,
    root: Context,
}

/// Subscribes to OS signals and dispatches them to registered handlers.
#[derive(Clone)]
pub struct SignalManager {
    inner: Arc<Inner>,
}

impl SignalManager {
    pub fn new(config: SignalConfig) -> Self {
        let capacity = config.buffer_size.max(1);
        Self {
            inner: Arc::new(Inner {
                config: ArcSwap::from_pointee(config),
                handlers: RwLock::new(HashMap::new()),
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                stats: DashMap::new(),
                listener: Mutex::new(None),
                root: Context::background(),
            }),
        }
    }

    /// Register (or replace) the handler for `signal`.
    ///
    /// The handler's context carries the category deadline. Cancellation is
    /// cooperative: a handler that never observes `ctx.done()` is recorded as
    /// timed out but keeps running until it returns.
    pub fn register_handler<F, Fut>(&self, signal: Signal, handler: F)
    where
        F: Fn(Context, Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, sig| Box::pin(handler(ctx, sig)));
        self.inner.handlers.write().insert(signal, handler);
        tracing::debug!(signal = %signal, "Signal handler registered");
    }

    /// Register one handler for several signals.
    pub fn register_multiple_handlers<F, Fut>(&self, signals: &[Signal], handler: F)
    where
        F: Fn(Context, Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, sig| Box::pin(handler(ctx, sig)));
        let mut handlers = self.inner.handlers.write();
        for signal in signals {
            handlers.insert(*signal, handler.clone());
            tracing::debug!(signal = %signal, "Signal handler registered");
        }
    }

    /// Remove the handler for `signal`. Returns whether one was registered.
    pub fn unregister_handler(&self, signal: Signal) -> bool {
        self.inner.handlers.write().remove(&signal).is_some()
    }

    pub fn has_handler(&self, signal: Signal) -> bool {
        self.inner.handlers.read().contains_key(&signal)
    }

    /// Signals watched under the current configuration.
    pub fn watched_signals(&self) -> Vec<Signal> {
        let config = self.inner.config.load();
        let mut signals = Vec::new();
        if config.enable_graceful {
            signals.extend([Signal::Terminate, Signal::Interrupt]);
        }
        if config.enable_force {
            signals.push(Signal::Quit);
        }
        if config.enable_reload {
            signals.push(Signal::Hangup);
        }
        signals
    }

    /// Subscribe to the watched signals and spawn the dispatch task.
    pub fn start_listening(&self) -> Result<(), SignalError> {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return Err(SignalError::AlreadyListening);
        }

        let signals = self.watched_signals();
        let streams = subscribe(&signals)?;

        let stop = CancellationToken::new();
        let task = tokio::spawn(dispatch_loop(self.clone(), streams, stop.clone()));
        *listener = Some(Listener { stop, task });

        tracing::info!(signals = ?signals, "Listening for signals");
        Ok(())
    }

    /// Stop the dispatch task and wait for it to exit. Safe to call when not
    /// listening. Must not be awaited from inside a signal handler, since the
    /// dispatch task is the one running it.
    pub async fn stop_listening(&self) {
        let listener = self.inner.listener.lock().take();
        let Some(Listener { stop, task }) = listener else {
            return;
        };

        stop.cancel();
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Signal dispatch task ended abnormally");
        }
        tracing::info!("Stopped listening for signals");
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Handler deadline for a signal category.
    pub fn signal_timeout(&self, signal_type: SignalType) -> Duration {
        let config = self.inner.config.load();
        match signal_type {
            SignalType::Graceful => config.graceful_timeout(),
            SignalType::Force => config.force_timeout(),
            SignalType::Reload => RELOAD_SIGNAL_TIMEOUT,
            SignalType::Unknown => UNKNOWN_SIGNAL_TIMEOUT,
        }
    }

    /// Process one received signal and return what was recorded.
    pub async fn handle_signal(&self, signal: Signal) -> SignalInfo {
        *self.inner.stats.entry(signal).or_insert(0) += 1;

        let signal_type = classify_signal(signal);
        let logging = self.inner.config.load().enable_logging;
        if logging {
            tracing::info!(signal = %signal, signal_type = ?signal_type, "Signal received");
        }

        let mut info = SignalInfo {
            signal,
            signal_type,
            timestamp: SystemTime::now(),
            process_id: std::process::id(),
            handled: false,
            error: None,
            duration: Duration::ZERO,
            timeout_hit: false,
        };

        let handler = self.inner.handlers.read().get(&signal).cloned();
        match handler {
            None => {
                tracing::warn!(signal = %signal, "No handler registered for signal");
                info.error = Some(format!("no handler registered for {}", signal));
            }
            Some(handler) => {
                let timeout = self.signal_timeout(signal_type);
                let ctx = self.inner.root.with_timeout(timeout);
                let task_ctx = ctx.clone();
                let run = run_with_deadline(&ctx, async move { handler(task_ctx, signal).await }).await;

                info.duration = run.elapsed;
                match run.outcome {
                    Outcome::Completed(Ok(())) => info.handled = true,
                    Outcome::Completed(Err(e)) => info.error = Some(e.to_string()),
                    Outcome::DeadlineExceeded => {
                        info.error = Some(format!("handler timed out after {:?}", timeout));
                        info.timeout_hit = true;
                    }
                    Outcome::Cancelled => info.error = Some("handler cancelled".to_string()),
                    Outcome::Panicked(msg) => info.error = Some(format!("handler panicked: {}", msg)),
                }

                if let Some(error) = &info.error {
                    tracing::error!(signal = %signal, error = %error, timeout_hit = info.timeout_hit, "Signal handler failed");
                } else if logging {
                    tracing::info!(signal = %signal, duration = ?info.duration, "Signal handled");
                }
            }
        }

        metrics::record_signal(&info);
        self.record(info.clone());
        info
    }

    fn record(&self, info: SignalInfo) {
        let capacity = self.inner.config.load().buffer_size.max(1);
        let mut buffer = self.inner.buffer.lock();
        buffer.push_back(info);
        while buffer.len() > capacity {
            buffer.pop_front();
        }
    }

    /// Signal history, oldest first.
    pub fn signal_buffer(&self) -> Vec<SignalInfo> {
        self.inner.buffer.lock().iter().cloned().collect()
    }

    /// Number of times each signal was received.
    pub fn signal_stats(&self) -> HashMap<Signal, u64> {
        self.inner
            .stats
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn clear_buffer(&self) {
        self.inner.buffer.lock().clear();
    }

    /// Replace the configuration. Rejected while listening.
    pub fn update_config(&self, config: SignalConfig) -> Result<(), SignalError> {
        // Hold the listener lock so listening cannot start mid-update.
        let listener = self.inner.listener.lock();
        if listener.is_some() {
            return Err(SignalError::ConfigWhileListening);
        }

        let capacity = config.buffer_size.max(1);
        self.inner.config.store(Arc::new(config));

        let mut buffer = self.inner.buffer.lock();
        while buffer.len() > capacity {
            buffer.pop_front();
        }
        Ok(())
    }

    pub fn config(&self) -> SignalConfig {
        self.inner.config.load().as_ref().clone()
    }

    /// Cancel the manager's root context: running handlers see their context
    /// cancelled, the dispatch loop exits and `wait_for_shutdown` returns.
    pub fn cancel(&self) {
        self.inner.root.cancel();
    }

    /// Wait until `cancel` is called.
    pub async fn wait_for_shutdown(&self) {
        self.inner.root.done().await;
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

#[cfg(unix)]
fn subscribe(signals: &[Signal]) -> Result<Vec<(Signal, SignalStream)>, SignalError> {
    signals
        .iter()
        .map(|signal| {
            tokio::signal::unix::signal(signal.kind())
                .map(|stream| (*signal, stream))
                .map_err(|source| SignalError::Subscribe {
                    signal: *signal,
                    source,
                })
        })
        .collect()
}

#[cfg(not(unix))]
fn subscribe(signals: &[Signal]) -> Result<Vec<(Signal, SignalStream)>, SignalError> {
    Ok(signals
        .iter()
        .filter(|s| **s == Signal::Interrupt)
        .map(|s| (*s, SignalStream))
        .collect())
}

async fn dispatch_loop(
    manager: SignalManager,
    mut streams: Vec<(Signal, SignalStream)>,
    stop: CancellationToken,
) {
    loop {
        let received = if streams.is_empty() {
            tokio::select! {
                _ = stop.cancelled() => None,
                _ = manager.inner.root.done() => None,
            }
        } else {
            let receivers = streams.iter_mut().map(|(signal, stream)| {
                let signal = *signal;
                Box::pin(async move { stream.recv().await.map(|_| signal) })
            });

            tokio::select! {
                _ = stop.cancelled() => None,
                _ = manager.inner.root.done() => None,
                (got, _, _) = select_all(receivers) => got,
            }
        };

        match received {
            Some(signal) => {
                manager.handle_signal(signal).await;
            }
            None => break,
        }
    }
    tracing::debug!("Signal dispatch loop exited");
}
