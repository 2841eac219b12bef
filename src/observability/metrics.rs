//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Expose a Prometheus-compatible scrape endpoint
//! - Record lifecycle, shutdown, signal and health metrics
//!
//! # Metrics
//! - `lifecycle_state` (gauge): 1 for the current state label, 0 otherwise
//! - `lifecycle_signals_total` (counter): by signal, handled
//! - `lifecycle_shutdown_step_duration_seconds` (histogram): by step, phase
//! - `lifecycle_shutdown_steps_total` (counter): by step, phase, outcome
//! - `lifecycle_health_check_duration_seconds` (histogram): by component
//! - `lifecycle_component_health` (gauge): 1=healthy, 0=otherwise
//! - `lifecycle_process_resident_bytes` (gauge)
//! - `lifecycle_runtime_alive_tasks` (gauge)
//!
//! # Design Decisions
//! - Recording is always safe: without an installed recorder the macros are
//!   no-ops, so tests and embedders need no setup

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

use crate::health::checker::{HealthCheckResult, HealthStatus};
use crate::health::system::SystemHealthSnapshot;
use crate::lifecycle::manager::LifecycleState;
use crate::lifecycle::shutdown::ShutdownResult;
use crate::lifecycle::signals::SignalInfo;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_lifecycle_state(state: LifecycleState) {
    for candidate in LifecycleState::ALL {
        let value = if candidate == state { 1.0 } else { 0.0 };
        gauge!("lifecycle_state", "state" => candidate.as_str()).set(value);
    }
}

pub fn record_shutdown_step(result: &ShutdownResult) {
    let outcome = if result.skipped {
        "skipped"
    } else if result.timeout_hit {
        "timeout"
    } else if result.success {
        "success"
    } else {
        "failure"
    };

    counter!(
        "lifecycle_shutdown_steps_total",
        "step" => result.step.clone(),
        "phase" => result.phase.as_str(),
        "outcome" => outcome
    )
    .increment(1);

    if !result.skipped {
        histogram!(
            "lifecycle_shutdown_step_duration_seconds",
            "step" => result.step.clone(),
            "phase" => result.phase.as_str()
        )
        .record(result.duration.as_secs_f64());
    }
}

pub fn record_signal(info: &SignalInfo) {
    counter!(
        "lifecycle_signals_total",
        "signal" => info.signal.to_string(),
        "handled" => if info.handled { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_health_check(result: &HealthCheckResult) {
    histogram!(
        "lifecycle_health_check_duration_seconds",
        "component" => result.component.clone()
    )
    .record(result.response_time.as_secs_f64());

    let healthy = if result.status == HealthStatus::Healthy { 1.0 } else { 0.0 };
    gauge!("lifecycle_component_health", "component" => result.component.clone()).set(healthy);
}

pub fn record_system_snapshot(snapshot: &SystemHealthSnapshot) {
    gauge!("lifecycle_process_resident_bytes").set(snapshot.memory.resident_bytes as f64);
    gauge!("lifecycle_runtime_alive_tasks").set(snapshot.runtime.alive_tasks as f64);
}
