//! Request sending with bounded retry of transient failures.
//!
//! [`Requester::send_until_done`] absorbs the window between a caller's
//! action and the connection actually being open, as well as backend races
//! such as `AlreadySubscribed`. Backoff doubles from
//! [`RetryPolicy::base_delay`] up to [`RetryPolicy::max_delay`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::connection::Reply;
use super::manager::ConnectionManager;
use crate::Result;
use crate::error::{QuotelineError, TransientKind};

/// Bounds on retrying a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Sends requests over the manager's current connection.
#[derive(Clone)]
pub struct Requester {
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
}

impl Requester {
    pub fn new(manager: Arc<ConnectionManager>, policy: RetryPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends `request` once.
    ///
    /// # Errors
    ///
    /// Returns any error from acquiring the connection or from the request.
    pub async fn send<R: Serialize + ?Sized>(&self, request: &R) -> Result<Reply> {
        let connection = self.manager.connection().await?;
        connection.request(request).await
    }

    /// Sends the request built by `factory`, retrying transient failures.
    ///
    /// [`TransientKind::NotReady`] is always retried; while waiting for it
    /// the delay ends early once the connection reports open. Other kinds are
    /// retried only if listed in `tolerable`. A fresh request is built for
    /// every attempt.
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned unchanged on first sight. A
    /// transient error that outlives the policy is wrapped in
    /// [`QuotelineError::RetriesExhausted`].
    pub async fn send_until_done<R, F>(
        &self,
        factory: F,
        tolerable: &[TransientKind],
    ) -> Result<Reply>
    where
        R: Serialize,
        F: Fn() -> R,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.send(&factory()).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            let Some(kind) = error.transient_kind() else {
                return Err(error);
            };
            if kind != TransientKind::NotReady && !tolerable.contains(&kind) {
                return Err(error);
            }
            if attempt >= self.policy.max_attempts {
                warn!(attempts = attempt, "Giving up on request: {error}");
                return Err(QuotelineError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.delay_for(attempt);
            debug!(
                attempt,
                ?kind,
                delay_ms = delay.as_millis() as u64,
                "Retrying request"
            );
            if kind == TransientKind::NotReady {
                self.manager.wait_until_open(delay).await;
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
