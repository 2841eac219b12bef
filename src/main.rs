//! lifecycled
//!
//! Runs the lifecycle orchestrator with the built-in heartbeat module until a
//! shutdown signal or a fatal error arrives.
//!
//! ```text
//!   SIGTERM / SIGINT ──┐        ┌──────────────────────────────────────┐
//!   SIGQUIT ───────────┼──────▶ │           LifecycleManager           │
//!   SIGHUP (opt-in) ───┘        │                                      │
//!                               │  Starter ─── modules (rank order)    │
//!                               │  ShutdownManager ─ Pre/Main/Post     │
//!                               │  SignalManager ─── dispatch loop     │
//!                               │  HealthManager ─── monitor loop      │
//!                               └──────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use service_lifecycle::config::load_or_default;
use service_lifecycle::modules::HeartbeatModule;
use service_lifecycle::observability::{logging, metrics};
use service_lifecycle::{Context, LifecycleManager};

#[derive(Parser)]
#[command(name = "lifecycled")]
#[command(about = "Service lifecycle orchestrator", long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overriding the configured one.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lifecycled: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.observability, args.log_level.as_deref()) {
        eprintln!("lifecycled: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lifecycled starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let manager = LifecycleManager::new(&config);

    if config.heartbeat.enabled {
        let heartbeat = Arc::new(HeartbeatModule::new(&config.heartbeat));
        if let Err(e) = manager.register_module(heartbeat) {
            tracing::error!(error = %e, "Failed to register heartbeat module");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = manager.start(&Context::background()).await {
        tracing::error!(error = %e, "Startup failed");
        return ExitCode::FAILURE;
    }

    let outcome = manager.wait_for_shutdown().await;

    for result in manager.shutdown_manager().results() {
        tracing::debug!(
            step = %result.step,
            phase = %result.phase,
            success = result.success,
            skipped = result.skipped,
            duration = ?result.duration,
            "Shutdown step result"
        );
    }
    match serde_json::to_string(&manager.metrics()) {
        Ok(summary) => tracing::info!(metrics = %summary, "Final lifecycle metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode lifecycle metrics"),
    }

    match outcome {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Shutdown finished with errors");
            ExitCode::FAILURE
        }
    }
}
