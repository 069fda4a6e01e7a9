//! Bounded reconnect policy shared by every channel backend.
//!
//! A [`RetryBudget`] counts consecutive transient failures. Each failure
//! waits a fixed backoff before the caller reconnects; once the count
//! exceeds [`ReconnectPolicy::max_retries`] the budget is exhausted and the
//! listen loop exits with [`ChannelError::RetriesExhausted`]. Any message
//! processed successfully resets the count.

use std::time::Duration;

use tracing::{error, warn};

use crate::error::ChannelError;

/// Default number of reconnect attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default fixed backoff between reconnect attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Reconnect parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive transient failures tolerated before giving up.
    pub max_retries: u32,
    /// Fixed wait before each reconnect.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy.
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Worst-case time spent backing off before the budget runs out.
    pub fn max_total_backoff(&self) -> Duration {
        self.backoff * self.max_retries
    }
}

/// Consecutive-failure counter for one listen loop.
#[derive(Debug)]
pub struct RetryBudget {
    policy: ReconnectPolicy,
    failures: u32,
    backend: &'static str,
}

impl RetryBudget {
    /// Creates a full budget.
    pub fn new(backend: &'static str, policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            backend,
        }
    }

    /// Restores the full budget after a successfully processed message.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Returns the number of consecutive failures recorded.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a transient failure and waits out the backoff.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::RetriesExhausted`] without waiting once the
    /// failure count exceeds the policy's `max_retries`.
    pub async fn on_failure(&mut self, err: ChannelError) -> Result<(), ChannelError> {
        self.failures += 1;
        if self.failures > self.policy.max_retries {
            error!(
                critical = true,
                backend = self.backend,
                attempts = self.failures,
                error = %err,
                "reconnect budget exhausted, giving up"
            );
            return Err(ChannelError::RetriesExhausted {
                attempts: self.failures,
                last: Box::new(err),
            });
        }
        warn!(
            backend = self.backend,
            attempt = self.failures,
            max_retries = self.policy.max_retries,
            backoff_ms = self.policy.backoff.as_millis() as u64,
            error = %err,
            "transient channel failure, reconnecting"
        );
        tokio::time::sleep(self.policy.backoff).await;
        Ok(())
    }
}
