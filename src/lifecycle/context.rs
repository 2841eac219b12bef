//! Cancellable, deadline-bound execution context.
//!
//! # Responsibilities
//! - Carry a cancellation signal down a tree of tasks
//! - Carry an optional deadline, tightened (never loosened) by children
//!
//! # Design Decisions
//! - Cancellation is cooperative: work that never awaits `done()` or checks
//!   `is_done()` keeps running past its deadline until it returns on its own
//! - Deadlines are checked lazily; no timer task exists per context

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Execution context handed to modules, shutdown steps, signal handlers and
/// health checkers.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context: never cancelled unless `cancel` is called, no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child that is cancelled with this context but can also be
    /// cancelled on its own.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is `timeout` from now, capped by the
    /// parent's deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all of its descendants.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True once the context was cancelled explicitly (or via an ancestor).
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// True when either cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline_exceeded()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_inherits_parent_cancellation() {
        let root = Context::background();
        let child = root.with_timeout(Duration::from_secs(60));
        let grandchild = child.with_cancel();

        root.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_done());
        grandchild.done().await;
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let root = Context::background();
        let child = root.with_cancel();
        child.cancel();

        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_is_capped_by_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(10));

        assert_eq!(child.deadline(), parent.deadline());

        child.done().await;
        assert!(child.deadline_exceeded());
        assert!(!child.is_cancelled());
    }

    #[test]
    fn test_background_has_no_deadline() {
        let ctx = Context::background();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_done());
    }
}
