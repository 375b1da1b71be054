//! Scrape context: a cancellation token with an optional deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::exporter::CollectError;

/// Context handed through a single scrape.
///
/// Work running under the context should either be wrapped with
/// [`ScrapeContext::run`] or watch [`ScrapeContext::cancelled`] so that it
/// stops promptly once the deadline passes. Dropping the context cancels it.
#[derive(Debug)]
pub struct ScrapeContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl ScrapeContext {
    /// Create a context expiring `timeout` from now, or never if `None`.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            token: CancellationToken::new(),
        }
    }

    /// A context without a deadline.
    pub fn background() -> Self {
        Self::new(None)
    }

    /// The instant at which the scrape expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the context was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancel the context and everything running under it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A token that fires when this context is cancelled.
    ///
    /// Useful for handing to spawned tasks that cannot borrow the context.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Resolves once the context is cancelled or the deadline passes.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = expiry(self.deadline) => {}
        }
    }

    /// Drive `fut` to completion unless the context ends first.
    ///
    /// On deadline expiry the context is cancelled, the future is dropped and
    /// [`CollectError::DeadlineExceeded`] is returned.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CollectError> {
        tokio::select! {
            biased;
            output = fut => Ok(output),
            _ = self.token.cancelled() => Err(CollectError::Cancelled),
            _ = expiry(self.deadline) => {
                self.token.cancel();
                Err(CollectError::DeadlineExceeded)
            }
        }
    }
}

impl Drop for ScrapeContext {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
