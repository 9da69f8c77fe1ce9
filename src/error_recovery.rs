//! Bounded retry for instrument calls that are known to fail transiently.
//
// Only integration-time setup uses this today: some spectrometers reject the first
// configuration request after the port opens. Sweep-time failures are never retried.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// One attempt plus at most one immediate retry.
    pub fn single_retry() -> Self {
        Self {
            max_attempts: 2,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    ///
    /// Returns the last error when every attempt fails. `what` names the operation in
    /// the log.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!("{what} failed (attempt {attempt}/{attempts}): {e}, retrying");
                    attempt += 1;
                    if !self.backoff_delay.is_zero() {
                        sleep(self.backoff_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
