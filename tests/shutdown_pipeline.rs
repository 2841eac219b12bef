//! Shutdown manager behaviour across phases and concurrent callers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use service_lifecycle::config::ShutdownConfig;
use service_lifecycle::lifecycle::{
    Context, ShutdownError, ShutdownManager, ShutdownPhase, ShutdownStep, StepError,
};

fn recording_step(
    name: &'static str,
    phase: ShutdownPhase,
    delay: Duration,
    log: &Arc<Mutex<Vec<String>>>,
) -> ShutdownStep {
    let log = log.clone();
    ShutdownStep::new(name, phase, move |_ctx| {
        let log = log.clone();
        async move {
            log.lock().push(format!("begin:{}", name));
            tokio::time::sleep(delay).await;
            log.lock().push(format!("end:{}", name));
            Ok::<(), StepError>(())
        }
    })
}

fn config(parallel: bool) -> ShutdownConfig {
    ShutdownConfig {
        parallel_execution: parallel,
        force_kill_after_ms: 0,
        ..ShutdownConfig::default()
    }
}

#[tokio::test]
async fn test_concurrent_phases_never_overlap() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = ShutdownManager::new(config(true));
    manager.add_shutdown_steps([
        recording_step("main-1", ShutdownPhase::Main, Duration::ZERO, &log),
        recording_step("pre-slow", ShutdownPhase::Pre, Duration::from_millis(80), &log),
        recording_step("pre-fast", ShutdownPhase::Pre, Duration::from_millis(10), &log),
        recording_step("post-1", ShutdownPhase::Post, Duration::ZERO, &log),
    ]);

    manager.execute_shutdown(&Context::background()).await.unwrap();

    let log = log.lock().clone();
    let position = |event: &str| log.iter().position(|e| e == event).unwrap();
    assert!(position("end:pre-slow") < position("begin:main-1"));
    assert!(position("end:pre-fast") < position("begin:main-1"));
    assert!(position("end:main-1") < position("begin:post-1"));
}

#[tokio::test]
async fn test_second_execution_is_rejected() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = Arc::new(ShutdownManager::new(config(false)));
    manager.add_shutdown_step(recording_step(
        "drain",
        ShutdownPhase::Main,
        Duration::from_millis(200),
        &log,
    ));

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute_shutdown(&Context::background()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.is_in_progress());

    let err = manager
        .execute_shutdown(&Context::background())
        .await
        .unwrap_err();
    assert!(matches!(err, ShutdownError::AlreadyInProgress));
    assert_eq!(err.to_string(), "shutdown already in progress");

    first.await.unwrap().unwrap();
    // Only the first execution ran the step.
    assert_eq!(log.lock().len(), 2);
    assert_eq!(manager.results().len(), 1);

    // The guard is released once the first call returns.
    manager.execute_shutdown(&Context::background()).await.unwrap();
    assert_eq!(manager.results().len(), 2);
}

#[tokio::test]
async fn test_required_timeout_names_step() {
    let manager = ShutdownManager::new(config(false));
    manager.add_shutdown_step(
        ShutdownStep::new("flush-buffers", ShutdownPhase::Main, |_ctx| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<(), StepError>(())
        })
        .with_timeout(Duration::from_millis(100))
        .required(true),
    );

    let err = manager
        .execute_shutdown(&Context::background())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("flush-buffers"));

    let results = manager.results();
    assert_eq!(results.len(), 1);
    assert!(results[0].timeout_hit);
    assert!(!results[0].success);
}

#[tokio::test]
async fn test_concurrent_required_failures_are_aggregated() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = ShutdownManager::new(config(true));
    manager.add_shutdown_steps([
        ShutdownStep::new("close-db", ShutdownPhase::Main, |_ctx| async {
            Err::<(), StepError>("db busy".into())
        })
        .required(true),
        ShutdownStep::new("close-queue", ShutdownPhase::Main, |_ctx| async {
            Err::<(), StepError>("queue busy".into())
        })
        .required(true),
        recording_step("flush-logs", ShutdownPhase::Main, Duration::from_millis(30), &log),
        recording_step("report", ShutdownPhase::Post, Duration::ZERO, &log),
    ]);

    let err = manager
        .execute_shutdown(&Context::background())
        .await
        .unwrap_err();
    match &err {
        ShutdownError::RequiredStepsFailed { phase, failures } => {
            assert_eq!(*phase, ShutdownPhase::Main);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Every Main step produced a result, Post never ran.
    assert_eq!(manager.results().len(), 3);
    assert!(log.lock().contains(&"end:flush-logs".to_string()));
    assert!(!log.lock().iter().any(|e| e.ends_with("report")));
}

#[tokio::test]
async fn test_cancel_skips_remaining_steps() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let manager = Arc::new(ShutdownManager::new(config(false)));
    manager.add_shutdown_steps([
        // Ignores its context, so it is still running when cancelled.
        ShutdownStep::new("stubborn", ShutdownPhase::Pre, |_ctx| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<(), StepError>(())
        }),
        recording_step("after", ShutdownPhase::Pre, Duration::ZERO, &log),
    ]);

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute_shutdown(&Context::background()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.cancel();
    running.await.unwrap().unwrap();

    let results = manager.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].error.as_deref(), Some("cancelled"));
    assert!(results[1].skipped);
    assert_eq!(results[1].skip_reason.as_deref(), Some("shutdown cancelled"));
    assert!(log.lock().is_empty());
}
