use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;

/// Cancellation scope bound to one command.
///
/// A zero timeout yields a cancel-only scope with no deadline.
#[derive(Debug, Clone)]
pub struct CancelContext {
    token: CancellationToken,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl CancelContext {
    pub fn new(timeout: Duration) -> Self {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        Self {
            token: CancellationToken::new(),
            timeout,
            deadline,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The error describing why the scope ended, or `None` if it is still live.
    ///
    /// An expired deadline wins over an explicit cancel.
    pub fn err(&self) -> Option<SandboxError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(SandboxError::Timeout(self.timeout));
        }
        if self.token.is_cancelled() {
            return Some(SandboxError::Cancelled);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_context_has_no_deadline() {
        let ctx = CancelContext::new(Duration::ZERO);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let ctx = CancelContext::new(Duration::ZERO);
        ctx.cancel();
        ctx.done().await;
        assert!(matches!(ctx.err(), Some(SandboxError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_reports_timeout() {
        let ctx = CancelContext::new(Duration::from_millis(20));
        ctx.done().await;
        assert!(matches!(ctx.err(), Some(SandboxError::Timeout(_))));
    }
}
