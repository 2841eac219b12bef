//! OS signal delivery through the signal manager.
//!
//! Signals are raised against this test process with `kill`, and only for
//! signals a handler is already subscribed to.

#![cfg(unix)]

use std::process::Command;
use std::time::Duration;
use tokio::sync::mpsc;

use service_lifecycle::config::SignalConfig;
use service_lifecycle::lifecycle::{
    Context, HandlerError, LifecycleManager, LifecycleState, Signal, SignalManager,
};

mod common;
use common::{quiet_config, EventLog, MockModule};

fn raise(signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(std::process::id().to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_hangup_reaches_registered_handler() {
    let manager = SignalManager::new(SignalConfig {
        enable_graceful: false,
        enable_force: false,
        enable_reload: true,
        ..SignalConfig::default()
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.register_handler(Signal::Hangup, move |_ctx: Context, signal| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(signal);
            Ok::<(), HandlerError>(())
        }
    });

    manager.start_listening().unwrap();
    raise("HUP");

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(received, Some(Signal::Hangup));

    manager.stop_listening().await;
    assert!(!manager.is_listening());

    let history = manager.signal_buffer();
    assert_eq!(history.len(), 1);
    assert!(history[0].handled);
    assert_eq!(manager.signal_stats()[&Signal::Hangup], 1);
}

#[tokio::test]
async fn test_sigterm_stops_the_service() {
    let mut config = quiet_config();
    config.signals.enable_graceful = true;

    let events = EventLog::default();
    let manager = LifecycleManager::new(&config);
    manager.register_module(MockModule::new("device", &events)).unwrap();
    manager.start(&Context::background()).await.unwrap();
    assert!(manager.signal_manager().is_listening());

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.wait_for_shutdown().await })
    };

    raise("TERM");

    tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(manager.state(), LifecycleState::Stopped);
    assert_eq!(events.with_prefix("stop:"), vec!["device"]);
    assert!(!manager.signal_manager().is_listening());

    let history = manager.signal_manager().signal_buffer();
    assert!(history
        .iter()
        .any(|info| info.signal == Signal::Terminate && info.handled));
}
