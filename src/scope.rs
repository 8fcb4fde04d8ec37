//! Hierarchical cancellation scopes and deadline helpers.
//!
//! A scope wraps a `CancellationToken`; cancelling a parent cancels every
//! descendant. Long-running operations check cooperatively at suspension
//! points and return `Cancelled`.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
}

impl CancelScope {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Child scope: cancelled when this scope is cancelled, but may be
    /// cancelled independently without affecting the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cooperative check for use at suspension points.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Runs a future until it completes or this scope is cancelled.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(EngineError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Runs a future under both this scope and a deadline. Deadline expiry
    /// yields `Timeout`, scope cancellation yields `Cancelled`.
    pub async fn run_with_deadline<F, T>(
        &self,
        operation: &str,
        budget: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(budget) => Err(EngineError::Timeout {
                operation: operation.to_string(),
                budget_secs: budget.as_secs(),
            }),
            out = fut => Ok(out),
        }
    }

    /// Cancellable sleep. Returns `Cancelled` if the scope fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_cancelled_by_parent() {
        let parent = CancelScope::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.check(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = CancelScope::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let scope = CancelScope::new();
        let result = scope
            .run_with_deadline("slow_op", Duration::from_secs(1), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Timeout { budget_secs: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_cancellation() {
        let scope = CancelScope::new();
        let inner = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            inner.cancel();
        });
        let result = scope.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
