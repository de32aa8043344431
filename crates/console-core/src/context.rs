use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConsoleError, Result};

/// Deadline plus cancellation signal carried through a single console operation.
///
/// Cloning shares the token; [`OpContext::child`] derives a token that is cancelled with
/// its parent but can also be cancelled on its own.
#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Instant,
    token: CancellationToken,
}

impl OpContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    /// Context cancelled together with `parent`.
    pub fn with_parent(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            token: parent.child_token(),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves once the deadline passes or the token is cancelled.
    pub async fn done(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    /// Run `fut` until it completes, the deadline passes, or the context is cancelled.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ConsoleError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(ConsoleError::Timeout),
            res = fut => res,
        }
    }
}
