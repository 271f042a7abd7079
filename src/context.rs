//! Per-request deadline and cancellation.
//!
//! Every cache and routing operation takes a [`RequestContext`]. Work that can
//! suspend (waiting on a per-key lock, a loader round trip, a remote hop) is
//! run through [`RequestContext::run`], which abandons the work as soon as the
//! deadline passes or the token is cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RingLimitError, Result};

/// Deadline and cancellation token for a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token; cancelling it aborts work run in this context.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RingLimitError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(RingLimitError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run `fut` until it completes or the context is done, whichever is first.
    ///
    /// On expiry the future is dropped, so any guard it holds is released.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RingLimitError::Cancelled),
            _ = deadline => Err(RingLimitError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_expires() {
        let ctx = RequestContext::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());

        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_expired_context_fails_fast() {
        let ctx = RequestContext::with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(RingLimitError::DeadlineExceeded)));

        let result = ctx.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(RingLimitError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_pending_work() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RingLimitError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_work() {
        let token = CancellationToken::new();
        let ctx = RequestContext::background().with_cancellation(token.clone());

        let handle = tokio::spawn(async move {
            ctx.run(std::future::pending::<Result<()>>()).await
        });
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RingLimitError::Cancelled)));
    }
}
