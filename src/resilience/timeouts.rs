//! Timeout enforcement.
//!
//! # Responsibilities
//! - Run a unit of work as its own task under a `Context`
//! - Report whether it finished, hit its deadline, was cancelled or panicked
//!
//! # Design Decisions
//! - Timeouts are distinct from other errors (`Outcome::DeadlineExceeded`)
//! - The spawned task is never aborted; when the deadline fires first the
//!   caller stops waiting but the work keeps running until it returns
//! - Callers that need to wait for such stragglers spawn on a `TaskTracker`

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::task::TaskTracker;

use crate::lifecycle::context::Context;

/// How a deadline-bound unit of work ended.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The work returned before its context finished.
    Completed(T),
    /// The context deadline passed first.
    DeadlineExceeded,
    /// The context was cancelled first.
    Cancelled,
    /// The work panicked.
    Panicked(String),
}

impl<T> Outcome<T> {
    /// True for `DeadlineExceeded`.
    pub fn timed_out(&self) -> bool {
        matches!(self, Outcome::DeadlineExceeded)
    }
}

/// Result of [`run_with_deadline`] plus how long the caller waited.
#[derive(Debug)]
pub struct Deadlined<T> {
    pub outcome: Outcome<T>,
    pub elapsed: Duration,
}

/// Spawn `fut` and wait for it or for `ctx` to finish, whichever is first.
pub async fn run_with_deadline<F, T>(ctx: &Context, fut: F) -> Deadlined<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let handle = tokio::spawn(fut);
    let outcome = wait(ctx, handle).await;
    Deadlined {
        outcome,
        elapsed: started.elapsed(),
    }
}

/// Like [`run_with_deadline`], but the task is spawned on `tracker` so that
/// its owner can later wait for stragglers.
pub async fn run_tracked_with_deadline<F, T>(
    tracker: &TaskTracker,
    ctx: &Context,
    fut: F,
) -> Deadlined<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let handle = tracker.spawn(fut);
    let outcome = wait(ctx, handle).await;
    Deadlined {
        outcome,
        elapsed: started.elapsed(),
    }
}

async fn wait<T>(ctx: &Context, handle: JoinHandle<T>) -> Outcome<T> {
    tokio::select! {
        biased;
        joined = handle => match joined {
            Ok(value) => Outcome::Completed(value),
            Err(e) => from_join_error(e),
        },
        _ = ctx.done() => {
            if ctx.deadline_exceeded() {
                Outcome::DeadlineExceeded
            } else {
                Outcome::Cancelled
            }
        }
    }
}

fn from_join_error<T>(err: JoinError) -> Outcome<T> {
    if err.is_panic() {
        Outcome::Panicked(panic_message(err.into_panic()))
    } else {
        Outcome::Cancelled
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let result = run_with_deadline(&ctx, async { 7 }).await;
        assert!(matches!(result.outcome, Outcome::Completed(7)));
    }

    #[tokio::test]
    async fn test_deadline_does_not_abort_the_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let tracker = TaskTracker::new();
        let ctx = Context::background().with_timeout(Duration::from_millis(20));

        let result = run_tracked_with_deadline(&tracker, &ctx, async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(result.outcome.timed_out());
        assert!(!finished.load(Ordering::SeqCst));

        tracker.close();
        tracker.wait().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_timeout() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let waiter = ctx.clone();
        ctx.cancel();
        let result = run_with_deadline(&waiter, std::future::pending::<()>()).await;
        assert!(matches!(result.outcome, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let ctx = Context::background();
        let result = run_with_deadline(&ctx, async {
            panic!("boom");
        })
        .await;
        match result.outcome {
            Outcome::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
